use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::ConfigurationError;

/// A java executable that has been probed and version-checked. The argument
/// builder only accepts resolved runtimes, never bare paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JavaRuntime {
    pub path: PathBuf,
    pub major: u32,
    pub full_version: String,
    pub vendor: String,
}

impl JavaRuntime {
    /// Runs `<path> -version` and parses the banner. `java -version` writes
    /// to stderr.
    pub async fn probe(path: &Path) -> Result<Self, ConfigurationError> {
        let output = Command::new(path)
            .arg("-version")
            .output()
            .await
            .map_err(|e| ConfigurationError::JavaProbeFailed(e.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let (major, full_version, vendor) = parse_java_version(&stderr).ok_or_else(|| {
            ConfigurationError::UnparseableJavaVersion(
                stderr.lines().next().unwrap_or_default().to_string(),
            )
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            major,
            full_version,
            vendor,
        })
    }

    pub fn require_major(&self, required: u32) -> Result<(), ConfigurationError> {
        if self.major != required {
            return Err(ConfigurationError::JavaMajorMismatch {
                required,
                found: self.major,
            });
        }
        Ok(())
    }
}

/// Parses `java -version` stderr. Handles both legacy "1.8.0_xxx" (major=8)
/// and modern "17.0.9" (major=17) formats. Returns (major, full_version, vendor).
fn parse_java_version(stderr: &str) -> Option<(u32, String, String)> {
    let full_version = stderr
        .lines()
        .find(|line| line.contains("version"))?
        .split('"')
        .nth(1)?
        .to_string();

    let major = if full_version.starts_with("1.") {
        full_version.split('.').nth(1)?.parse::<u32>().ok()?
    } else {
        full_version.split('.').next()?.parse::<u32>().ok()?
    };

    let vendor = if stderr.contains("Eclipse Adoptium") || stderr.contains("Temurin") {
        "Eclipse Adoptium"
    } else if stderr.contains("Oracle") || stderr.contains("Java(TM)") {
        "Oracle"
    } else if stderr.contains("Microsoft") {
        "Microsoft"
    } else if stderr.contains("GraalVM") {
        "GraalVM"
    } else if stderr.contains("Azul") || stderr.contains("Zulu") {
        "Azul Zulu"
    } else if stderr.contains("Amazon") || stderr.contains("Corretto") {
        "Amazon Corretto"
    } else if stderr.contains("OpenJDK") {
        "OpenJDK"
    } else {
        "Unknown"
    };

    Some((major, full_version, vendor.to_string()))
}
