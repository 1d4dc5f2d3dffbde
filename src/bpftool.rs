//! Attaches sched_ext schedulers through `bpftool`.
//!
//! Registering a struct_ops object pins its link under the sched_ext bpffs
//! directory; removing that pin detaches the scheduler and the kernel falls
//! back to the default policy.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::activation::Activator;
use crate::module_store::ModuleId;

/// Locations used to attach and inspect sched_ext schedulers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BpftoolConfig {
    /// `bpftool` binary, looked up in PATH when relative
    pub bpftool: PathBuf,
    /// bpffs directory the struct_ops link is pinned into
    pub pin_dir: PathBuf,
    /// Name of the pinned link inside `pin_dir`
    pub link_name: String,
    /// sched_ext sysfs directory
    pub sched_ext_dir: PathBuf,
}

impl Default for BpftoolConfig {
    fn default() -> Self {
        Self {
            bpftool: PathBuf::from("bpftool"),
            pin_dir: PathBuf::from("/sys/fs/bpf/sched_ext"),
            link_name: "sched_ops".to_string(),
            sched_ext_dir: PathBuf::from("/sys/kernel/sched_ext"),
        }
    }
}

/// [`Activator`] backed by `bpftool struct_ops register`
#[derive(Debug, Clone, Default)]
pub struct BpftoolActivator {
    config: BpftoolConfig,
}

impl BpftoolActivator {
    pub fn new(config: BpftoolConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BpftoolConfig {
        &self.config
    }

    fn ops_file(&self) -> PathBuf {
        self.config.sched_ext_dir.join("root").join("ops")
    }

    fn link_path(&self) -> PathBuf {
        self.config.pin_dir.join(&self.config.link_name)
    }

    /// Whether any sched_ext scheduler is currently attached
    pub fn is_attached(&self) -> bool {
        self.ops_file().exists()
    }

    /// Name of the attached sched_ext ops, if any
    pub fn current(&self) -> Result<Option<String>> {
        let ops_file = self.ops_file();
        match fs::read_to_string(&ops_file) {
            Ok(ops) => Ok(Some(ops.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", ops_file.display())),
        }
    }

    /// Check that bpftool runs and the kernel exposes sched_ext
    pub fn check_dependencies(&self) -> Result<()> {
        let output = Command::new(&self.config.bpftool)
            .arg("version")
            .output()
            .with_context(|| {
                format!(
                    "'{}' is not found in PATH",
                    self.config.bpftool.display()
                )
            })?;
        if !output.status.success() {
            bail!(
                "'{}' is not usable: {}",
                self.config.bpftool.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        if !self.config.sched_ext_dir.exists() {
            bail!("Kernel does not have sched_ext functionalities");
        }

        Ok(())
    }

    fn detach(&self) -> Result<()> {
        let link = self.link_path();
        match fs::remove_file(&link) {
            Ok(()) => {
                debug!(link = %link.display(), "struct_ops link removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                bail!("No custom schedulers are attached ({} missing)", link.display())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", link.display())),
        }
    }
}

impl Activator for BpftoolActivator {
    fn activate(&mut self, module: &ModuleId) -> Result<()> {
        // A link pinned outside this process blocks registration.
        if self.link_path().exists() {
            self.detach()
                .context("Failed to stop currently running scheduler")?;
        }

        let output = Command::new(&self.config.bpftool)
            .arg("struct_ops")
            .arg("register")
            .arg(&module.path)
            .arg(&self.config.pin_dir)
            .output()
            .with_context(|| {
                format!("Failed to run {}", self.config.bpftool.display())
            })?;

        if !output.status.success() {
            bail!(
                "bpftool struct_ops register {} exited with {}: {}",
                module.path.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        info!(module = %module, path = %module.path.display(), "scheduler attached");
        Ok(())
    }

    fn deactivate(&mut self) -> Result<()> {
        self.detach()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{Activation, ActivationError, ActivationState};
    use crate::policy::Decision;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Mutex;

    // Writing an executable while another thread forks can fail its exec
    // with ETXTBSY, so process-spawning tests run one at a time.
    static SPAWN: Mutex<()> = Mutex::new(());

    fn sandbox(dir: &Path, bpftool: impl Into<PathBuf>) -> BpftoolActivator {
        let pin_dir = dir.join("bpf");
        let sched_ext_dir = dir.join("sched_ext");
        fs::create_dir_all(&pin_dir).unwrap();
        fs::create_dir_all(&sched_ext_dir).unwrap();
        BpftoolActivator::new(BpftoolConfig {
            bpftool: bpftool.into(),
            pin_dir,
            link_name: "sched_ops".to_string(),
            sched_ext_dir,
        })
    }

    /// A bpftool that pins a link on `register` and refuses any object whose
    /// path contains `lottery`.
    fn fake_bpftool(dir: &Path) -> PathBuf {
        let path = dir.join("bpftool");
        fs::write(
            &path,
            "#!/bin/sh\n\
             case \"$3\" in\n\
               *lottery*) echo 'libbpf: failed to attach struct_ops' >&2; exit 255 ;;\n\
             esac\n\
             touch \"$4/sched_ops\"\n",
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn attach_fake(activator: &BpftoolActivator, ops: &str) {
        let root = activator.config().sched_ext_dir.join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("ops"), format!("{ops}\n")).unwrap();
        fs::write(activator.link_path(), b"").unwrap();
    }

    fn select(dir: &Path, name: &str) -> Decision {
        Decision::Selected {
            module: ModuleId::new(name, dir.join(name)),
            priority: 1,
        }
    }

    #[test]
    fn current_reports_attached_ops() {
        let dir = tempfile::tempdir().unwrap();
        let activator = sandbox(dir.path(), "true");

        assert_eq!(activator.current().unwrap(), None);
        assert!(!activator.is_attached());

        attach_fake(&activator, "fifo");
        assert_eq!(activator.current().unwrap(), Some("fifo".to_string()));
        assert!(activator.is_attached());
    }

    #[test]
    fn deactivate_removes_pinned_link() {
        let dir = tempfile::tempdir().unwrap();
        let mut activator = sandbox(dir.path(), "true");
        attach_fake(&activator, "fifo");

        activator.deactivate().unwrap();
        assert!(!activator.link_path().exists());
        assert!(activator.deactivate().is_err());
    }

    #[test]
    fn activate_removes_stale_link_first() {
        let _spawn = SPAWN.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut activator = sandbox(dir.path(), "true");
        attach_fake(&activator, "fifo");

        activator
            .activate(&ModuleId::new("lottery.bpf.c.o", dir.path().join("lottery.bpf.c.o")))
            .unwrap();
        assert!(!activator.link_path().exists());
    }

    #[test]
    fn failing_bpftool_is_an_error() {
        let _spawn = SPAWN.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut activator = sandbox(dir.path(), "false");

        let err = activator
            .activate(&ModuleId::new("fifo.bpf.c.o", dir.path().join("fifo.bpf.c.o")))
            .unwrap_err();
        assert!(err.to_string().contains("struct_ops register"));
    }

    #[test]
    fn missing_bpftool_is_an_error() {
        let _spawn = SPAWN.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut activator = sandbox(dir.path(), "/nonexistent/bpftool");

        assert!(activator
            .activate(&ModuleId::new("fifo.bpf.c.o", dir.path().join("fifo.bpf.c.o")))
            .is_err());
        assert!(activator.check_dependencies().is_err());
    }

    #[test]
    fn failed_register_is_reflected_in_activation_state() {
        let _spawn = SPAWN.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let bpftool = fake_bpftool(dir.path());
        let mut activation = Activation::new(sandbox(dir.path(), bpftool));
        let link = activation.activator().link_path();

        activation.apply(&select(dir.path(), "fifo.bpf.c.o")).unwrap();
        assert!(link.exists());

        let err = activation
            .apply(&select(dir.path(), "lottery.bpf.c.o"))
            .unwrap_err();
        assert!(matches!(err, ActivationError::Attach { .. }));
        assert!(err.to_string().contains("failed to attach struct_ops"));
        assert!(!link.exists());
        assert_eq!(activation.state(), &ActivationState::Inactive);

        // Going back to fifo registers it again instead of trusting stale state.
        activation.apply(&select(dir.path(), "fifo.bpf.c.o")).unwrap();
        assert!(link.exists());
        assert_eq!(
            activation.state().module().map(|m| m.name.as_str()),
            Some("fifo.bpf.c.o")
        );
    }
}
