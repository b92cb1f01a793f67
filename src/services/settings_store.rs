use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::cmp::Ordering;
use std::fs;
use std::io;
use thiserror::Error;

/// Sentinel file name watched by a cooperating worker
pub const CANCEL_FILE_NAME: &str = "generation.cancel";

/// Errors raised by settings, preset and version file plumbing
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No settings_list.json found at {0}")]
    MissingSettingsList(Utf8PathBuf),

    #[error("Settings schema at {0} is not a JSON object")]
    InvalidSettingsList(Utf8PathBuf),
}

/// Locations of everything the bridge reads or writes inside the worker source tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePaths {
    root: Utf8PathBuf,
    generator_script: String,
    settings_to_json_script: String,
}

impl SourcePaths {
    pub fn new(
        root: impl Into<Utf8PathBuf>,
        generator_script: impl Into<String>,
        settings_to_json_script: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            generator_script: generator_script.into(),
            settings_to_json_script: settings_to_json_script.into(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn generator_script(&self) -> Utf8PathBuf {
        self.root.join(&self.generator_script)
    }

    pub fn settings_to_json_script(&self) -> Utf8PathBuf {
        self.root.join(&self.settings_to_json_script)
    }

    pub fn settings_file(&self) -> Utf8PathBuf {
        self.root.join("settings.sav")
    }

    pub fn presets_file(&self) -> Utf8PathBuf {
        self.root.join("presets.sav")
    }

    pub fn version_file(&self) -> Utf8PathBuf {
        self.root.join("version.py")
    }

    pub fn settings_list(&self) -> Utf8PathBuf {
        self.root.join("data").join("generated").join("settings_list.json")
    }

    pub fn default_presets(&self) -> Utf8PathBuf {
        self.root.join("data").join("presets_default.json")
    }

    pub fn presets_dir(&self) -> Utf8PathBuf {
        self.root.join("data").join("Presets")
    }

    pub fn cancel_file(&self) -> Utf8PathBuf {
        self.root.join(CANCEL_FILE_NAME)
    }

    /// Resolve a UI-supplied path: empty means the source root, relative
    /// paths are taken from the source root.
    pub fn resolve_user_path(&self, path: Option<&str>) -> Utf8PathBuf {
        match path.filter(|p| !p.is_empty()) {
            None => self.root.clone(),
            Some(p) if Utf8Path::new(p).is_absolute() => Utf8PathBuf::from(p),
            Some(p) => self.root.join(p),
        }
    }
}

/// Persists the settings a job is about to run with
#[cfg_attr(test, mockall::automock)]
pub trait SettingsWriter: Send + Sync {
    fn save_settings(&self, settings: &Map<String, Value>) -> Result<(), StoreError>;
}

/// Version information read from the worker's `version.py`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceVersion {
    pub base_version: String,
    pub supplementary_version: u64,
    pub full_version: String,
    pub branch_url: String,
}

/// Reads and writes settings, presets and version files under the source root.
///
/// Files are replaced whole on every write; no locking is done.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    paths: SourcePaths,
    base_version: Regex,
    supplementary_version: Regex,
    full_version: Regex,
    branch_url: Regex,
}

impl SettingsStore {
    pub fn new(paths: SourcePaths) -> Self {
        Self {
            paths,
            base_version: Regex::new(r#"(?m)^[ \t]*__version__ = ['"](.+)['"]"#).expect("Invalid base version regex"),
            supplementary_version: Regex::new(r"(?m)^[ \t]*supplementary_version = (\d+)\r?$")
                .expect("Invalid supplementary version regex"),
            full_version: Regex::new(r#"(?m)^[ \t]*__version__ = f['"]*(.+)['"]"#).expect("Invalid full version regex"),
            branch_url: Regex::new(r#"(?m)^[ \t]*branch_url = ['"](.+)['"]"#).expect("Invalid branch url regex"),
        }
    }

    pub fn paths(&self) -> &SourcePaths {
        &self.paths
    }

    /// Raw text of the last saved settings, `None` when nothing was saved yet
    pub fn load_last_settings(&self) -> Result<Option<String>, StoreError> {
        read_optional(&self.paths.settings_file())
    }

    /// Write the user presets text verbatim
    pub fn save_presets(&self, presets: &str) -> Result<(), StoreError> {
        let path = self.paths.presets_file();
        fs::write(&path, presets).map_err(|source| StoreError::Write { path: path.clone(), source })?;
        tracing::debug!("Saved presets to {}", path);
        Ok(())
    }

    /// Settings schema with the merged preset table.
    ///
    /// Presets are layered: the two static entries, then built-in presets
    /// (`presets_default.json` followed by `data/Presets/*.json` in natural
    /// order) tagged as protected, then user presets from `presets.sav`.
    /// A name is never overwritten once present. Unreadable preset files are
    /// skipped.
    pub fn load_gui_settings(&self) -> Result<Value, StoreError> {
        let schema_path = self.paths.settings_list();
        let Some(schema_text) = read_optional(&schema_path)? else {
            return Err(StoreError::MissingSettingsList(schema_path));
        };

        let mut schema: Value = serde_json::from_str(&schema_text).map_err(|source| StoreError::Json {
            path: schema_path.clone(),
            source,
        })?;
        let Some(schema_obj) = schema.as_object_mut() else {
            return Err(StoreError::InvalidSettingsList(schema_path));
        };

        let mut presets = Map::new();
        presets.insert("[New Preset]".to_string(), json!({ "isNewPreset": true }));
        presets.insert("Default / Beginner".to_string(), json!({ "isDefaultPreset": true }));

        for file in self.builtin_preset_files() {
            let Some(builtin) = read_preset_file(&file) else {
                continue;
            };
            for (name, settings) in builtin {
                if !presets.contains_key(&name) {
                    presets.insert(name, json!({ "isProtectedPreset": true, "settings": settings }));
                }
            }
        }

        if let Some(user) = read_preset_file(&self.paths.presets_file()) {
            for (name, settings) in user {
                if !presets.contains_key(&name) {
                    presets.insert(name, json!({ "settings": settings }));
                }
            }
        }

        schema_obj.insert("presets".to_string(), Value::Object(presets));
        Ok(schema)
    }

    /// Parse `version.py`; `None` when the file does not exist
    pub fn load_source_version(&self) -> Result<Option<SourceVersion>, StoreError> {
        let Some(text) = read_optional(&self.paths.version_file())? else {
            return Ok(None);
        };

        let capture = |pattern: &Regex| pattern.captures(&text).and_then(|c| c.get(1)).map(|m| m.as_str().to_string());

        let base_version = capture(&self.base_version).unwrap_or_default();
        let supplementary_version = capture(&self.supplementary_version)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let full_version = capture(&self.full_version)
            .unwrap_or_else(|| base_version.clone())
            .replacen("{base_version}", &base_version, 1)
            .replacen("{supplementary_version}", &supplementary_version.to_string(), 1);
        let branch_url = capture(&self.branch_url).unwrap_or_default();

        Ok(Some(SourceVersion {
            base_version,
            supplementary_version,
            full_version,
            branch_url,
        }))
    }

    fn builtin_preset_files(&self) -> Vec<Utf8PathBuf> {
        let mut files = vec![self.paths.default_presets()];

        let dir = self.paths.presets_dir();
        match dir.read_dir_utf8() {
            Ok(entries) => {
                let mut names: Vec<String> = entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.file_name().to_string())
                    .collect();
                names.sort_by(|a, b| natural_cmp(a, b));
                files.extend(names.into_iter().filter(|n| n.ends_with(".json")).map(|n| dir.join(n)));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to list presets in {}: {}", dir, e),
        }

        files
    }
}

impl SettingsWriter for SettingsStore {
    /// Persist settings as `settings.sav`, adding `check_version: true`
    fn save_settings(&self, settings: &Map<String, Value>) -> Result<(), StoreError> {
        let mut settings = settings.clone();
        settings.insert("check_version".to_string(), Value::Bool(true));

        let path = self.paths.settings_file();
        let text = to_pretty_json(&Value::Object(settings)).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;

        fs::write(&path, text).map_err(|source| StoreError::Write { path: path.clone(), source })?;
        tracing::debug!("Saved settings to {}", path);
        Ok(())
    }
}

/// JSON with a four-space indent, the layout the worker writes itself
fn to_pretty_json(value: &Value) -> Result<String, serde_json::Error> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn read_optional(path: &Utf8Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn read_preset_file(path: &Utf8Path) -> Option<Map<String, Value>> {
    let text = match read_optional(path) {
        Ok(Some(text)) => text,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!("Skipping presets: {}", e);
            return None;
        }
    };

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(presets)) => Some(presets),
        Ok(_) => {
            tracing::warn!("Skipping presets in {}: not a JSON object", path);
            None
        }
        Err(e) => {
            tracing::warn!("Skipping presets in {}: {}", path, e);
            None
        }
    }
}

/// Compare file names so that `Preset 2` sorts before `Preset 10`
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a_chars, mut b_chars) = (a.chars().peekable(), b.chars().peekable());

    loop {
        match (a_chars.peek().copied(), b_chars.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let a_num = take_digits(&mut a_chars);
                let b_num = take_digits(&mut b_chars);
                let a_trimmed = a_num.trim_start_matches('0');
                let b_trimmed = b_num.trim_start_matches('0');
                let ord = a_trimmed
                    .len()
                    .cmp(&b_trimmed.len())
                    .then_with(|| a_trimmed.cmp(b_trimmed));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let ord = x.to_lowercase().cmp(y.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                a_chars.next();
                b_chars.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.next_if(char::is_ascii_digit) {
        digits.push(c);
    }
    digits
}
