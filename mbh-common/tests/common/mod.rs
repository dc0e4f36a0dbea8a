//! Fixtures shared by the end-to-end suites.
//!
//! Servers are `/bin/sh` scripts run from a temporary project root, so the
//! real launch, log-polling and signal paths are exercised without a JVM.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mbh_common::HarnessConfig;
use mbh_common::mock::{MockHost, MockTransport};
use tempfile::TempDir;
use tracing_subscriber::{EnvFilter, fmt};

pub const READY_LINE: &str = r#"[12:00:00] [Server thread/INFO] [minecraft/DedicatedServer]: Done (1.234s)! For help, type "help""#;

pub fn init_test_logging() {
    let _ = fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mbh_common=debug".parse().unwrap()))
        .try_init();
}

/// Temporary project root laid out like a real checkout.
pub struct TestProject {
    pub dir: TempDir,
    pub config: HarnessConfig,
}

impl TestProject {
    pub fn new() -> Self {
        init_test_logging();
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = fast_config(dir.path());
        fs::create_dir_all(&config.paths.server_dir).expect("Failed to create server dir");
        fs::create_dir_all(&config.paths.baseline_dir).expect("Failed to create baseline dir");
        Self { dir, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn server_dir(&self) -> &Path {
        &self.config.paths.server_dir
    }

    /// Body of the launch script; runs under `/bin/sh` in the server dir.
    pub fn write_server_script(&self, body: &str) {
        fs::write(self.server_dir().join("run.sh"), body).expect("Failed to write run.sh");
    }

    /// Server that prints the banner plus `lines`, then idles until killed.
    pub fn write_ready_server(&self, lines: &[&str]) {
        let mut script = String::new();
        script.push_str(&format!("echo '{READY_LINE}'\n"));
        for line in lines {
            script.push_str(&format!("echo '{line}'\n"));
        }
        script.push_str("exec sleep 30\n");
        self.write_server_script(&script);
    }

    pub fn write_baseline(&self, name: &str, rows: &[(&str, i32, i32, i32)]) -> PathBuf {
        let mut csv = String::from("biome_id,x,z,surface_y,is_block_coord\n");
        for (biome, x, z, y) in rows {
            csv.push_str(&format!("{biome},{x},{z},{y},true\n"));
        }
        let path = self.config.paths.baseline_dir.join(name);
        fs::write(&path, csv).expect("Failed to write baseline");
        path
    }

    pub fn server_log(&self) -> String {
        fs::read_to_string(self.config.paths.server_log()).unwrap_or_default()
    }
}

/// Defaults scaled down so every bounded wait finishes in well under a
/// second. The launch script is `/bin/sh run.sh`.
pub fn fast_config(root: &Path) -> HarnessConfig {
    let mut config = HarnessConfig::for_project(root);
    config.server.launch_script = "/bin/sh".to_string();
    config.server.launch_args = vec!["run.sh".to_string()];

    let t = &mut config.timeouts;
    t.zombie_cleanup = Duration::from_millis(500);
    t.server_startup = Duration::from_secs(5);
    t.server_shutdown = Duration::from_millis(300);
    t.graceful_kill = Duration::from_secs(2);
    t.kill_confirm = Duration::from_secs(2);
    t.log_poll_interval = Duration::from_millis(25);
    t.port_poll_interval = Duration::from_millis(10);
    t.term_poll_interval = Duration::from_millis(10);
    t.term_poll_attempts = 3;
    t.bulk_operation = Duration::from_secs(2);
    t.generation_settle = Duration::ZERO;
    t.save_flush = Duration::ZERO;
    t.world_deletion = Duration::from_secs(2);
    t.ready_probe_min_window = Duration::from_millis(500);

    let c = &mut config.channel;
    c.connect_timeout = Duration::from_millis(200);
    c.command_timeout = Duration::from_millis(200);
    c.max_retries = 1;
    c.retry_delay = Duration::from_millis(10);
    c.ready_probe_retries = 3;
    c.ready_probe_delay = Duration::from_millis(20);
    config
}

pub fn transport() -> Arc<MockTransport> {
    Arc::new(MockTransport::new())
}

pub fn host() -> Arc<MockHost> {
    Arc::new(MockHost::new())
}

/// One `[TEST_RESULT]` inspection line as the server prints it.
pub fn inspection_line(x: i32, y: i32, z: i32, baseline: &str, actual: &str) -> String {
    format!(
        r#"[TEST_RESULT] {{"command":"batch_inspect","x":{x},"y":{y},"z":{z},"baseline_biome":"{baseline}","actual_biome":"{actual}"}}"#
    )
}
