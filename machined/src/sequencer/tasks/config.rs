//! Tasks: machine config load/save and user-supplied files.

use super::{Ctx, log_task_error};
use crate::config::{FileConfig, FileOp, MachineConfig};
use crate::constants::paths;
use crate::mount::manager::bind_file;
use crate::pipeline::PhaseTask;
use crate::runtime::SystemLayout;
use crate::util::blocking;
use async_trait::async_trait;
use machined_shared::{MachinedError, MachinedResult, MultiError};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct LoadConfig;

#[async_trait]
impl PhaseTask<Ctx> for LoadConfig {
    fn name(&self) -> &str {
        "load_config"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let path = ctx.layout().config_path();
        let config = match MachineConfig::from_file(&path) {
            Ok(config) => {
                info!(path = %path.display(), "Using persisted machine config");
                config
            }
            Err(e) if e.is_not_found() => {
                info!(platform = ctx.platform().name(), "Fetching machine config from platform");
                let bytes = ctx.platform().configuration().await?;
                MachineConfig::from_bytes(&bytes)?
            }
            Err(e) => return Err(e),
        };

        config
            .validate(ctx.mode())
            .inspect_err(|e| log_task_error(self.name(), e))?;
        ctx.set_config(config);
        Ok(())
    }
}

pub struct SaveConfig;

#[async_trait]
impl PhaseTask<Ctx> for SaveConfig {
    fn name(&self) -> &str {
        "save_config"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let config = ctx.config()?;
        if !config.persist {
            debug!("Config persistence disabled");
            return Ok(());
        }
        let path = ctx.layout().config_path();
        blocking(move || config.save(&path)).await
    }
}

// ============================================================================
// USER FILES
// ============================================================================

pub struct WriteUserFiles;

#[async_trait]
impl PhaseTask<Ctx> for WriteUserFiles {
    fn name(&self) -> &str {
        "write_user_files"
    }

    async fn run(self: Box<Self>, ctx: Ctx) -> MachinedResult<()> {
        let config = ctx.config()?;
        let layout = ctx.layout().clone();

        blocking(move || {
            let bindings = write_user_files(&layout, &config.machine.files)?;
            let errors: MultiError = bindings
                .iter()
                .filter_map(|(source, target)| bind_file(source, target, true).err())
                .collect();
            errors
                .into_result()
                .map_err(|errors| MachinedError::Internal(errors.to_string()))
        })
        .await
    }
}

/// Write `files` under `layout`. Files outside `/var` land in `/var/<path>`
/// and are returned as `(source, target)` pairs for a read-only bind.
///
/// Creating a file outside `/var` aborts immediately; every other failure
/// is collected and reported together.
pub(super) fn write_user_files(
    layout: &SystemLayout,
    files: &[FileConfig],
) -> MachinedResult<Vec<(PathBuf, PathBuf)>> {
    let mut errors = MultiError::new();
    let mut bindings = Vec::new();

    for file in files {
        let in_var = file.in_var();
        if !in_var && file.op == FileOp::Create {
            return Err(MachinedError::Precondition(format!(
                "create operation not allowed outside of /var: {:?}",
                file.path
            )));
        }

        match write_user_file(layout, file, in_var) {
            Ok(Some(binding)) => bindings.push(binding),
            Ok(None) => {}
            Err(e) => errors.push(e),
        }
    }

    errors
        .into_result()
        .map_err(|errors| MachinedError::Internal(errors.to_string()))?;
    Ok(bindings)
}

fn write_user_file(
    layout: &SystemLayout,
    file: &FileConfig,
    in_var: bool,
) -> MachinedResult<Option<(PathBuf, PathBuf)>> {
    let target = layout.path(&file.path);

    let content = match file.op {
        FileOp::Create => file.content.clone(),
        FileOp::Overwrite => {
            existing_regular_file(&target)?;
            file.content.clone()
        }
        FileOp::Append => {
            existing_regular_file(&target)?;
            let existing = std::fs::read_to_string(&target)?;
            format!("{}\n{}", existing, file.content)
        }
    };

    let destination = if in_var {
        target.clone()
    } else {
        let relative = Path::new(&file.path).strip_prefix("/").unwrap_or(Path::new(&file.path));
        layout.path(Path::new(paths::EPHEMERAL_MOUNT_POINT).join(relative))
    };

    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&destination, content)?;
    std::fs::set_permissions(
        &destination,
        std::fs::Permissions::from_mode(file.permissions),
    )?;
    debug!(path = %file.path, op = ?file.op, "Wrote user file");

    Ok((!in_var).then_some((destination, target)))
}

fn existing_regular_file(path: &Path) -> MachinedResult<()> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MachinedError::NotFound(format!("file must exist: {}", path.display()))
        } else {
            MachinedError::Io(e)
        }
    })?;
    if !metadata.is_file() {
        return Err(MachinedError::InvalidArgument(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &str, op: FileOp) -> FileConfig {
        FileConfig {
            path: path.to_string(),
            content: content.to_string(),
            permissions: 0o600,
            op,
        }
    }

    #[test]
    fn test_create_in_var() {
        let root = tempfile::tempdir().unwrap();
        let layout = SystemLayout::new(root.path());

        let bindings =
            write_user_files(&layout, &[file("/var/etc/motd", "hello", FileOp::Create)]).unwrap();

        assert!(bindings.is_empty());
        let written = root.path().join("var/etc/motd");
        assert_eq!(std::fs::read_to_string(&written).unwrap(), "hello");
        let mode = std::fs::metadata(&written).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_create_outside_var_rejected() {
        let root = tempfile::tempdir().unwrap();
        let layout = SystemLayout::new(root.path());

        let err = write_user_files(&layout, &[file("/etc/motd", "x", FileOp::Create)]).unwrap_err();
        assert!(matches!(err, MachinedError::Precondition(_)));
    }

    #[test]
    fn test_append_outside_var_is_redirected() {
        let root = tempfile::tempdir().unwrap();
        let layout = SystemLayout::new(root.path());
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::fs::write(root.path().join("etc/hosts"), "127.0.0.1 localhost").unwrap();

        let bindings =
            write_user_files(&layout, &[file("/etc/hosts", "10.0.0.1 api", FileOp::Append)]).unwrap();

        let source = root.path().join("var/etc/hosts");
        assert_eq!(bindings, vec![(source.clone(), root.path().join("etc/hosts"))]);
        assert_eq!(
            std::fs::read_to_string(&source).unwrap(),
            "127.0.0.1 localhost\n10.0.0.1 api"
        );
    }

    #[test]
    fn test_missing_targets_are_collected() {
        let root = tempfile::tempdir().unwrap();
        let layout = SystemLayout::new(root.path());

        let err = write_user_files(
            &layout,
            &[
                file("/var/a", "1", FileOp::Overwrite),
                file("/var/b", "2", FileOp::Append),
                file("/var/c", "3", FileOp::Create),
            ],
        )
        .unwrap_err()
        .to_string();

        assert!(err.contains("/var/a"));
        assert!(err.contains("/var/b"));
        assert!(root.path().join("var/c").exists());
    }
}
