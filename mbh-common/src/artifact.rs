//! Keeps the server's installed mod jar in step with the build output.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::{HarnessError, HarnessResult};

const EXCLUDED_SUFFIXES: &[&str] = &["-sources.jar", "-javadoc.jar"];

/// Newest `<prefix>*.jar` in `dir`, ignoring sources and javadoc jars.
pub fn find_mod_jar(dir: &Path, prefix: &str) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let matches = name.starts_with(prefix)
                && name.ends_with(".jar")
                && !EXCLUDED_SUFFIXES.iter().any(|s| name.ends_with(s));
            if !matches {
                return None;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, entry.path()))
        })
        .max()
        .map(|(_, path)| path)
}

/// Hex SHA-256 of a file, streamed.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JarSync {
    /// No build output to install.
    MissingBuild,
    Installed(String),
    Replaced(String),
    UpToDate(String),
}

impl JarSync {
    /// Console line, if the outcome is worth showing.
    pub fn message(&self) -> Option<String> {
        match self {
            Self::MissingBuild => Some("No mod JAR found in build/libs/. Run './gradlew build' first.".to_string()),
            Self::Installed(name) => Some(format!("Copied mod JAR to server: {name}")),
            Self::Replaced(name) => Some(format!("Updated mod JAR: {name}")),
            Self::UpToDate(_) => None,
        }
    }

    pub fn copied(&self) -> bool {
        matches!(self, Self::Installed(_) | Self::Replaced(_))
    }
}

/// Copy the newest build jar into `mods_dir` unless an identical one is
/// already installed.
pub fn sync_mod_jar(build_dir: &Path, mods_dir: &Path, prefix: &str) -> HarnessResult<JarSync> {
    let Some(build_jar) = find_mod_jar(build_dir, prefix) else {
        return Ok(JarSync::MissingBuild);
    };
    let name = build_jar
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dest = mods_dir.join(&name);

    let Some(server_jar) = find_mod_jar(mods_dir, prefix) else {
        fs::create_dir_all(mods_dir).map_err(|e| HarnessError::file(mods_dir, e))?;
        fs::copy(&build_jar, &dest).map_err(|e| HarnessError::file(&dest, e))?;
        return Ok(JarSync::Installed(name));
    };

    let build_hash = file_sha256(&build_jar).map_err(|e| HarnessError::file(&build_jar, e))?;
    let server_hash = file_sha256(&server_jar).map_err(|e| HarnessError::file(&server_jar, e))?;
    if build_hash == server_hash {
        debug!(jar = %server_jar.display(), "Mod JAR up to date");
        return Ok(JarSync::UpToDate(name));
    }

    if server_jar != dest {
        fs::remove_file(&server_jar).map_err(|e| HarnessError::file(&server_jar, e))?;
        debug!(jar = %server_jar.display(), "Removed old JAR");
    }
    fs::copy(&build_jar, &dest).map_err(|e| HarnessError::file(&dest, e))?;
    Ok(JarSync::Replaced(name))
}
