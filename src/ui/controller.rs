// Request handlers - wires every UI request name to the services behind it
//
// Sync handlers answer with their result. Async handlers answer with an
// acknowledgement and report the outcome through push events.

use crate::context::AppContext;
use crate::services::conversion::ConversionKind;
use crate::services::job::{GenerateRequest, JobError};
use crate::services::settings_store::SettingsWriter;
use crate::state::BridgeEvent;
use crate::ui::desktop::FileFilter;
use crate::ui::router::{HandlerFuture, MessageRouter, PayloadContract, RequestKind};
use camino::Utf8PathBuf;
use serde_json::{Value, json};
use std::fs;
use std::sync::Arc;

type HandlerFn = fn(Arc<AppContext>, Value) -> HandlerFuture;

/// One request the UI may send and the handler that serves it
#[derive(Clone, Copy)]
pub struct Request {
    pub name: &'static str,
    pub kind: RequestKind,
    pub contract: PayloadContract,
    handler: HandlerFn,
}

macro_rules! request {
    ($name:literal, $kind:ident, $contract:ident, $handler:path) => {
        Request {
            name: $name,
            kind: RequestKind::$kind,
            contract: PayloadContract::$contract,
            handler: |ctx: Arc<AppContext>, payload: Value| -> HandlerFuture { Box::pin($handler(ctx, payload)) },
        }
    };
}

/// Every request the UI may send, with its kind, payload contract and handler
pub const REQUESTS: &[Request] = &[
    request!("getCurrentSourceVersion", Sync, Any, current_source_version),
    request!("getGeneratorGUISettings", Sync, Any, generator_gui_settings),
    request!("getGeneratorGUILastUserSettings", Sync, Any, last_user_settings),
    request!("saveCurrentSettingsToFile", Sync, NonEmptyObject, save_settings),
    request!("saveCurrentPresetsToFile", Sync, NonEmptyString, save_presets),
    request!("convertSettingsToString", Async, NonEmptyObject, convert_settings_to_string),
    request!("convertStringToSettings", Async, NonEmptyString, convert_string_to_settings),
    request!("updateDynamicSetting", Async, NonEmptyString, update_dynamic_setting),
    request!("generateSeed", Async, GenerateSeed, generate_seed),
    request!("cancelGenerateSeed", Async, Any, cancel_generate_seed),
    request!("window-minimize", Sync, Any, window_minimize),
    request!("window-maximize", Sync, Any, window_maximize),
    request!("window-close", Sync, Any, window_close),
    request!("window-is-maximized", Sync, Any, window_is_maximized),
    request!("copyToClipboard", Sync, ClipboardContent, copy_to_clipboard),
    request!("browseForFile", Async, FileTypes, browse_for_file),
    request!("browseForDirectory", Async, Any, browse_for_directory),
    request!("createAndOpenPath", Sync, Any, create_and_open_path),
];

/// Register the handler of every entry of [`REQUESTS`]
pub fn register_handlers(router: &mut MessageRouter<AppContext>) {
    for request in REQUESTS {
        router.register(request.name, request.kind, request.contract, request.handler);
    }
}

async fn current_source_version(ctx: Arc<AppContext>, _payload: Value) -> Value {
    match ctx.store.load_source_version() {
        Ok(Some(version)) => json!(version),
        Ok(None) => {
            tracing::warn!("No version information found in {}", ctx.paths().version_file());
            Value::Null
        }
        Err(e) => {
            tracing::warn!("Failed to read source version: {}", e);
            Value::Null
        }
    }
}

async fn generator_gui_settings(ctx: Arc<AppContext>, _payload: Value) -> Value {
    match ctx.store.load_gui_settings() {
        Ok(settings) => Value::String(settings.to_string()),
        Err(e) => {
            ctx.fatal("missing_settings_list", e.to_string());
            Value::Bool(false)
        }
    }
}

async fn last_user_settings(ctx: Arc<AppContext>, _payload: Value) -> Value {
    match ctx.store.load_last_settings() {
        Ok(Some(text)) => Value::String(text),
        Ok(None) => Value::Bool(false),
        Err(e) => {
            tracing::warn!("Failed to read last user settings: {}", e);
            Value::Bool(false)
        }
    }
}

async fn save_settings(ctx: Arc<AppContext>, payload: Value) -> Value {
    let Some(settings) = payload.as_object() else {
        return Value::Bool(false);
    };

    match ctx.store.save_settings(settings) {
        Ok(()) => Value::Null,
        Err(e) => {
            tracing::warn!("Failed to save settings: {}", e);
            Value::Bool(false)
        }
    }
}

async fn save_presets(ctx: Arc<AppContext>, payload: Value) -> Value {
    let Some(presets) = payload.as_str() else {
        return Value::Bool(false);
    };

    match ctx.store.save_presets(presets) {
        Ok(()) => Value::Null,
        Err(e) => {
            tracing::warn!("Failed to save presets: {}", e);
            Value::Bool(false)
        }
    }
}

async fn convert_settings_to_string(ctx: Arc<AppContext>, payload: Value) -> Value {
    start_conversion(ctx, ConversionKind::SettingsToString, payload)
}

async fn convert_string_to_settings(ctx: Arc<AppContext>, payload: Value) -> Value {
    start_conversion(ctx, ConversionKind::StringToSettings, payload)
}

async fn update_dynamic_setting(ctx: Arc<AppContext>, payload: Value) -> Value {
    start_conversion(ctx, ConversionKind::UpdateDynamicSetting, payload)
}

fn start_conversion(ctx: Arc<AppContext>, kind: ConversionKind, payload: Value) -> Value {
    tokio::spawn(async move {
        match ctx.converter.convert(kind, &payload).await {
            Ok(value) => {
                ctx.state.publish(BridgeEvent::ConversionSucceeded { kind, value });
            }
            Err(failure) => {
                let missing_dependency = failure.is_missing_dependency();
                let short = failure.short.clone();
                ctx.state.publish(BridgeEvent::ConversionFailed { kind, failure });
                if missing_dependency {
                    ctx.fatal("missing_dependency", short);
                }
            }
        }
    });

    Value::Bool(true)
}

async fn generate_seed(ctx: Arc<AppContext>, payload: Value) -> Value {
    let Some(request) = GenerateRequest::from_payload(&payload) else {
        return Value::Bool(false);
    };

    match ctx.jobs.start_job(request) {
        Ok(ticket) => {
            tracing::debug!("Accepted generation job {}", ticket.id);
            Value::Bool(true)
        }
        Err(JobError::AlreadyRunning(_)) => Value::Bool(false),
    }
}

async fn cancel_generate_seed(ctx: Arc<AppContext>, _payload: Value) -> Value {
    Value::Bool(ctx.jobs.cancel_active_job())
}

async fn window_minimize(ctx: Arc<AppContext>, _payload: Value) -> Value {
    ctx.window.minimize();
    Value::Null
}

async fn window_maximize(ctx: Arc<AppContext>, _payload: Value) -> Value {
    ctx.window.toggle_maximize();
    Value::Null
}

async fn window_close(ctx: Arc<AppContext>, _payload: Value) -> Value {
    ctx.window.close();
    Value::Null
}

async fn window_is_maximized(ctx: Arc<AppContext>, _payload: Value) -> Value {
    Value::Bool(ctx.window.is_maximized())
}

async fn copy_to_clipboard(ctx: Arc<AppContext>, payload: Value) -> Value {
    let Some(content) = payload["content"].as_str() else {
        return Value::Bool(false);
    };

    match ctx.desktop.copy_to_clipboard(content.to_string()).await {
        Ok(()) => Value::Bool(true),
        Err(e) => {
            tracing::warn!("{}", e);
            Value::Bool(false)
        }
    }
}

async fn browse_for_file(ctx: Arc<AppContext>, payload: Value) -> Value {
    let filters = FileFilter::parse_list(&payload["fileTypes"]);
    paths_to_json(ctx.desktop.browse_for_file(filters).await)
}

async fn browse_for_directory(ctx: Arc<AppContext>, _payload: Value) -> Value {
    paths_to_json(ctx.desktop.browse_for_directory().await)
}

fn paths_to_json(paths: Option<Vec<Utf8PathBuf>>) -> Value {
    match paths {
        Some(paths) => Value::Array(paths.into_iter().map(|path| Value::String(path.into_string())).collect()),
        None => Value::Null,
    }
}

/// Open `path`, creating it first when missing.
///
/// Returns `true` when the path already existed. A created path is opened in
/// the background and the opener's error (empty on success) is pushed as
/// `createAndOpenPathResult`.
async fn create_and_open_path(ctx: Arc<AppContext>, payload: Value) -> Value {
    let target = ctx.paths().resolve_user_path(payload.as_str());

    if target.exists() {
        tokio::spawn(async move {
            if let Err(e) = ctx.desktop.open_path(&target).await {
                tracing::warn!("{}", e);
            }
        });
        return Value::Bool(true);
    }

    if let Err(e) = fs::create_dir_all(&target) {
        tracing::warn!("Failed to create {}: {}", target, e);
        return Value::Bool(false);
    }
    tracing::info!("Created {}", target);

    tokio::spawn(async move {
        let message = match ctx.desktop.open_path(&target).await {
            Ok(()) => String::new(),
            Err(e) => {
                tracing::warn!("{}", e);
                e.to_string()
            }
        };
        ctx.state.publish(BridgeEvent::CreateAndOpenPathResult(message));
    });

    Value::Bool(false)
}
