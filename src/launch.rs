use std::path::PathBuf;

use crate::{
    account::Credential, config::InstanceConfig, error::ConfigurationError, java::JavaRuntime,
};

pub const LAUNCHER_BRAND: &str = "LaunchGuard";
pub const LAUNCHER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Resolved on-disk layout for one launchable version, produced by the
/// content-management collaborator ahead of launch.
#[derive(Debug, Clone)]
pub struct PreparedRuntime {
    pub classpath: Vec<PathBuf>,
    pub game_jar: PathBuf,
    pub main_class: String,
    pub asset_index: String,
    pub assets_dir: PathBuf,
    pub natives_dir: PathBuf,
    pub instance_dir: PathBuf,
}

fn classpath_separator() -> &'static str {
    if cfg!(windows) { ";" } else { ":" }
}

/// Builds the full argument vector for the JVM invocation, in launch order:
/// memory flags, launcher system properties, user JVM args, classpath, main
/// class, game args, resolution flags, user game args.
///
/// Pure: no I/O, deterministic for identical inputs. The java path itself is
/// not part of the output; the spawner receives it separately.
pub fn build_arguments(
    config: &InstanceConfig,
    java: &JavaRuntime,
    prepared: &PreparedRuntime,
    credential: &Credential,
) -> Result<Vec<String>, ConfigurationError> {
    java.require_major(config.java_major)?;

    if prepared.main_class.is_empty() {
        return Err(ConfigurationError::MissingField("main_class"));
    }
    if prepared.classpath.is_empty() && prepared.game_jar.as_os_str().is_empty() {
        return Err(ConfigurationError::MissingField("classpath"));
    }

    let mut classpath: Vec<String> = prepared
        .classpath
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    classpath.push(prepared.game_jar.to_string_lossy().to_string());
    let classpath_str = classpath.join(classpath_separator());

    let mut args = vec![
        format!("-Xms{}", config.memory_min),
        format!("-Xmx{}", config.memory_max),
        format!(
            "-Djava.library.path={}",
            prepared.natives_dir.to_string_lossy()
        ),
        format!("-Dminecraft.launcher.brand={}", LAUNCHER_BRAND),
        format!("-Dminecraft.launcher.version={}", LAUNCHER_VERSION),
    ];
    args.extend(config.extra_jvm_args.iter().cloned());
    args.push("-cp".to_string());
    args.push(classpath_str);
    args.push(prepared.main_class.clone());

    args.extend([
        "--username".to_string(),
        credential.username.clone(),
        "--version".to_string(),
        config.game_version.clone(),
        "--gameDir".to_string(),
        prepared.instance_dir.to_string_lossy().to_string(),
        "--assetsDir".to_string(),
        prepared.assets_dir.to_string_lossy().to_string(),
        "--assetIndex".to_string(),
        prepared.asset_index.clone(),
        "--uuid".to_string(),
        credential.player_uuid.to_string(),
        "--accessToken".to_string(),
        credential.access_token.clone(),
        "--userType".to_string(),
        credential.user_type.clone(),
        "--versionType".to_string(),
        config.version_type.clone(),
    ]);

    if let Some(res) = config.resolution {
        args.push("--width".to_string());
        args.push(res.width.to_string());
        args.push("--height".to_string());
        args.push(res.height.to_string());
    }

    args.extend(config.extra_game_args.iter().cloned());

    Ok(args)
}
