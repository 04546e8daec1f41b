//! Static decompilation of the APK.

use crate::exec::{CommandRunner, ToolSpec};
use crate::logging::truncate_for_log;
use exn_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Where a finished decompilation left its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompiledTree {
    pub root: PathBuf,
    pub manifest: PathBuf,
    pub sources: PathBuf,
    /// Output from an earlier run was reused.
    pub reused: bool,
}

impl DecompiledTree {
    fn at(root: &Path, reused: bool) -> Self {
        Self {
            root: root.to_path_buf(),
            manifest: root.join("resources").join("AndroidManifest.xml"),
            sources: root.join("sources"),
            reused,
        }
    }
}

pub trait Decompiler {
    fn decompile(&self, apk: &Path, out_dir: &Path) -> Result<DecompiledTree>;
}

/// Runs `jadx <apk> -d <out_dir>`.
pub struct JadxDecompiler<'a> {
    runner: &'a dyn CommandRunner,
    jadx: String,
    timeout: Duration,
}

impl<'a> JadxDecompiler<'a> {
    pub fn new(runner: &'a dyn CommandRunner, jadx: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            jadx: jadx.into(),
            timeout,
        }
    }
}

impl Decompiler for JadxDecompiler<'_> {
    fn decompile(&self, apk: &Path, out_dir: &Path) -> Result<DecompiledTree> {
        let resources = out_dir.join("resources");
        if resources.exists() {
            debug!(out_dir = %out_dir.display(), "decompiled output already present");
            return Ok(DecompiledTree::at(out_dir, true));
        }

        let spec = ToolSpec::new(
            &self.jadx,
            vec![
                apk.to_string_lossy().into_owned(),
                "-d".to_string(),
                out_dir.to_string_lossy().into_owned(),
            ],
        )
        .with_timeout(self.timeout);
        let output = self
            .runner
            .run(&spec)
            .map_err(|e| Error::DecompileFailed(format!("{}: {}", spec.command_line(), e)))?;

        // jadx exits non-zero on partial failures but still writes usable output.
        if !resources.exists() {
            return Err(Error::DecompileFailed(format!(
                "{} left no resources directory (exit {:?}): {}",
                spec.command_line(),
                output.exit_code,
                truncate_for_log(output.combined().trim(), 256)
            )));
        }

        info!(out_dir = %out_dir.display(), exit_code = ?output.exit_code, "decompiled");
        Ok(DecompiledTree::at(out_dir, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ToolError, ToolOutput};
    use crate::test_utils::{Reply, ScriptedRunner};
    use tempfile::tempdir;

    /// Behaves like jadx: writes the output layout, exits non-zero.
    struct PartialJadx;

    impl CommandRunner for PartialJadx {
        fn run(&self, spec: &ToolSpec) -> std::result::Result<ToolOutput, ToolError> {
            let out = PathBuf::from(&spec.args[2]);
            std::fs::create_dir_all(out.join("resources"))?;
            std::fs::create_dir_all(out.join("sources"))?;
            Ok(ToolOutput::completed(spec, "", "ERROR - finished with errors, count: 3\n", 1))
        }
    }

    #[test]
    fn test_existing_output_is_reused() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("resources")).unwrap();
        let runner = ScriptedRunner::new();

        let tree = JadxDecompiler::new(&runner, "jadx", Duration::from_secs(5))
            .decompile(Path::new("/tmp/app.apk"), dir.path())
            .unwrap();

        assert!(tree.reused);
        assert_eq!(tree.manifest, dir.path().join("resources/AndroidManifest.xml"));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_partial_failure_with_output_counts_as_done() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("jadx");

        let tree = JadxDecompiler::new(&PartialJadx, "jadx", Duration::from_secs(5))
            .decompile(Path::new("/tmp/app.apk"), &out)
            .unwrap();

        assert!(!tree.reused);
        assert_eq!(tree.sources, out.join("sources"));
    }

    #[test]
    fn test_missing_resources_is_a_failure() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("jadx");
        let runner = ScriptedRunner::new().on("jadx", Reply::fail(1, "ERROR - file not found\n"));

        let err = JadxDecompiler::new(&runner, "jadx", Duration::from_secs(5))
            .decompile(Path::new("/tmp/app.apk"), &out)
            .unwrap_err();

        assert!(matches!(err, Error::DecompileFailed(ref m) if m.contains("file not found")));
        assert_eq!(
            runner.calls(),
            vec![format!("jadx /tmp/app.apk -d {}", out.display())]
        );
    }

    #[test]
    fn test_missing_binary_is_a_failure() {
        let dir = tempdir().unwrap();
        let runner = ScriptedRunner::new().on("jadx", Reply::NotFound);

        let err = JadxDecompiler::new(&runner, "jadx", Duration::from_secs(5))
            .decompile(Path::new("/tmp/app.apk"), dir.path())
            .unwrap_err();

        assert!(matches!(err, Error::DecompileFailed(_)));
    }
}
