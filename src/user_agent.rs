//! User agent generation for backend requests
//!
//! Format: `fortune-sync/{version} ({os}-{kernel}-{arch}) rustc/{version}`

use std::env;
use sysinfo::System;

pub fn generate_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    let os_info = get_os_info();

    format!(
        "fortune-sync/{} ({}-{}-{}) {}",
        version,
        os_info.os,
        os_info.kernel,
        os_info.arch,
        get_runtime_info()
    )
}

struct OsInfo {
    os: String,
    kernel: String,
    arch: String,
}

fn get_os_info() -> OsInfo {
    let os = System::name().unwrap_or_else(|| "unknown".to_string());
    let kernel = System::kernel_version().unwrap_or_else(|| "unknown".to_string());
    let arch = match env::consts::ARCH {
        "aarch64" => "arm64".to_string(),
        arch => arch.to_string(),
    };

    OsInfo {
        os: sanitize_token(&os),
        kernel: sanitize_token(&kernel),
        arch,
    }
}

/// Lowercase and replace characters that would break the header token.
fn sanitize_token(value: &str) -> String {
    value
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() || c == '(' || c == ')' { '_' } else { c })
        .collect()
}

fn get_runtime_info() -> String {
    let rustc_version = option_env!("RUSTC_VERSION").unwrap_or("1.75.0");
    format!("rustc/{}", rustc_version)
}
