//! # Launcher: how a worker process is started.
//!
//! The supervisor never builds commands itself; it asks a [`Launcher`] for the
//! [`Command`] of a slot and spawns it. [`ExecLauncher`] re-executes the current
//! binary in worker mode; [`FnLauncher`] lets embedders and tests run anything.
//!
//! ```text
//! procvisor [--config FILE] --runtime-dir DIR --namespace NS worker --id <i>
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::SubstrateConfig;

/// Produces the command for one worker slot.
pub trait Launcher: Send + Sync + 'static {
    fn command(&self, worker_id: u32) -> Command;
}

/// Re-executes a binary (normally the current one) as `worker --id <i>`.
#[derive(Debug, Clone)]
pub struct ExecLauncher {
    program: PathBuf,
    global_args: Vec<OsString>,
}

impl ExecLauncher {
    /// Launcher for `program`, forwarding the config file and substrate location
    /// so workers attach to the same namespace.
    pub fn new(program: impl Into<PathBuf>, config_path: Option<&Path>, substrate: &SubstrateConfig) -> Self {
        let mut global_args: Vec<OsString> = Vec::new();
        if let Some(path) = config_path {
            global_args.push("--config".into());
            global_args.push(path.as_os_str().to_owned());
        }
        global_args.push("--runtime-dir".into());
        global_args.push(substrate.runtime_dir.as_os_str().to_owned());
        global_args.push("--namespace".into());
        global_args.push(substrate.namespace.clone().into());

        Self {
            program: program.into(),
            global_args,
        }
    }

    /// Launcher for the running executable.
    pub fn current(config_path: Option<&Path>, substrate: &SubstrateConfig) -> std::io::Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, config_path, substrate))
    }
}

impl Launcher for ExecLauncher {
    fn command(&self, worker_id: u32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.global_args)
            .arg("worker")
            .arg("--id")
            .arg(worker_id.to_string());
        cmd
    }
}

/// Launcher backed by a closure.
///
/// ```
/// use procvisor::FnLauncher;
/// use tokio::process::Command;
///
/// let launcher = FnLauncher::new(|_id| {
///     let mut cmd = Command::new("sleep");
///     cmd.arg("30");
///     cmd
/// });
/// # let _ = launcher;
/// ```
pub struct FnLauncher<F> {
    f: F,
}

impl<F> FnLauncher<F>
where
    F: Fn(u32) -> Command + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Launcher for FnLauncher<F>
where
    F: Fn(u32) -> Command + Send + Sync + 'static,
{
    fn command(&self, worker_id: u32) -> Command {
        (self.f)(worker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_launcher_forwards_substrate_location() {
        let substrate = SubstrateConfig {
            runtime_dir: PathBuf::from("/run/pv"),
            namespace: "ns1".to_owned(),
            ..SubstrateConfig::default()
        };
        let launcher = ExecLauncher::new("/usr/bin/procvisor", Some(Path::new("/etc/pv.toml")), &substrate);
        let cmd = launcher.command(3);
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "/usr/bin/procvisor");
        let args: Vec<&std::ffi::OsStr> = std_cmd.get_args().collect();
        assert_eq!(
            args,
            [
                "--config",
                "/etc/pv.toml",
                "--runtime-dir",
                "/run/pv",
                "--namespace",
                "ns1",
                "worker",
                "--id",
                "3"
            ]
        );
    }

    #[test]
    fn fn_launcher_receives_slot() {
        let launcher = FnLauncher::new(|id| {
            let mut cmd = Command::new("echo");
            cmd.arg(format!("slot-{id}"));
            cmd
        });
        let cmd = launcher.command(7);
        let args: Vec<&std::ffi::OsStr> = cmd.as_std().get_args().collect();
        assert_eq!(args, ["slot-7"]);
    }
}
