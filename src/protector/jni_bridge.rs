//! JNI entry points for the Android host.
//!
//! The host talks to one process-wide [`Protector`]; it is created lazily on
//! first use (normally from `JNI_OnLoad`) and lives until the process exits.
//! Nothing here panics across the boundary: every export maps failures to a
//! `false`/`null` return.

#![allow(non_snake_case)]

use std::ffi::c_void;
use std::sync::OnceLock;

use jni::objects::{JObject, JString};
use jni::sys::{jboolean, jint, jstring, JNI_FALSE, JNI_TRUE, JNI_VERSION_1_6};
use jni::{JNIEnv, JavaVM};
use log::{info, warn};

#[cfg(target_os = "android")]
use android_logger::Config;
#[cfg(target_os = "android")]
use log::LevelFilter;

use crate::protector::{ProtectionConfig, Protector, ThreatVerdict};

#[cfg(target_os = "android")]
const LOG_TAG: &str = "SecureNativeLib";

static PROTECTOR: OnceLock<Protector> = OnceLock::new();

fn protector() -> &'static Protector {
    PROTECTOR.get_or_init(|| {
        init_logging();
        Protector::new(ProtectionConfig::default())
    })
}

#[cfg(target_os = "android")]
fn init_logging() {
    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Info)
            .with_tag(LOG_TAG),
    );
}

/// Hosts off Android install their own `log` backend
#[cfg(not(target_os = "android"))]
fn init_logging() {}

fn to_jboolean(value: bool) -> jboolean {
    if value {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

#[no_mangle]
pub extern "system" fn JNI_OnLoad(_vm: JavaVM, _reserved: *mut c_void) -> jint {
    let protector = protector();
    protector.initialize_protection();
    info!("Native security library loaded");
    JNI_VERSION_1_6
}

#[no_mangle]
pub extern "C" fn Java_com_aiassistant_security_AntiDetectionManager_initializeNativeSecurity(
    _env: JNIEnv,
    _this: JObject,
) {
    if !protector().initialize_protection() {
        warn!("Native security initialized with reduced protection");
    }
}

#[no_mangle]
pub extern "C" fn Java_com_aiassistant_security_AntiDetectionManager_isRunningInEmulator(
    _env: JNIEnv,
    _this: JObject,
) -> jboolean {
    to_jboolean(protector().is_running_in_emulator())
}

#[no_mangle]
pub extern "C" fn Java_com_aiassistant_security_AntiDetectionManager_hasHookFramework(
    _env: JNIEnv,
    _this: JObject,
) -> jboolean {
    to_jboolean(protector().has_hook_framework())
}

/// `ThreatVerdict` of every probe as JSON.
#[no_mangle]
pub extern "C" fn Java_com_aiassistant_security_AntiDetectionManager_nativeThreatReport(
    env: JNIEnv,
    _this: JObject,
) -> jstring {
    let json = serde_json::to_string(&protector().current_verdict()).unwrap_or_else(|_| {
        serde_json::to_string(&ThreatVerdict::default()).unwrap_or_else(|_| String::from("{}"))
    });

    match env.new_string(&json) {
        Ok(jstr) => jstr.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn Java_com_aiassistant_security_SecurityContext_setNativeSecurityLevel(
    _env: JNIEnv,
    _this: JObject,
    level: jint,
) {
    protector().set_security_level(level);
}

#[no_mangle]
pub extern "C" fn Java_com_aiassistant_core_ai_AIStateManager_isBeingAnalyzedNative(
    _env: JNIEnv,
    _this: JObject,
) -> jboolean {
    to_jboolean(protector().is_being_analyzed())
}

#[no_mangle]
pub extern "C" fn Java_com_aiassistant_security_ProcessIsolation_nativeSpoofProcessName(
    mut env: JNIEnv,
    _this: JObject,
    name: JString,
) -> jboolean {
    let name: String = match env.get_string(&name) {
        Ok(java_str) => java_str.into(),
        Err(e) => {
            warn!("nativeSpoofProcessName: unreadable name: {}", e);
            return JNI_FALSE;
        }
    };

    to_jboolean(protector().spoof_process_name(&name))
}

#[no_mangle]
pub extern "C" fn Java_com_aiassistant_security_ProcessIsolation_nativeHideProcessInfo(
    _env: JNIEnv,
    _this: JObject,
    pid: jint,
) -> jboolean {
    to_jboolean(protector().hide_process_info(pid))
}
