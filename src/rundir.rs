//! Per-run state directory
//!
//! Layout: `<rundir>/<node>/nspid` holds the pid to `nsenter` for entering
//! the node, `cmd.out`/`cmd.err` capture the node workload and `console` is
//! the serial socket of VM nodes.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        debug!("Run directory {}", root.display());
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Directory of `node`, created on first use.
    pub fn node_dir(&self, node: &str) -> io::Result<PathBuf> {
        let dir = self.root.join(node);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn write_nspid(&self, node: &str, pid: i32) -> io::Result<()> {
        let path = self.node_dir(node)?.join("nspid");
        std::fs::write(path, format!("{}\n", pid))
    }

    pub fn read_nspid(&self, node: &str) -> Option<i32> {
        std::fs::read_to_string(self.root.join(node).join("nspid"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Fresh stdout/stderr capture files for the workload of `node`.
    pub fn output_files(&self, node: &str) -> io::Result<(File, File)> {
        let dir = self.node_dir(node)?;
        Ok((File::create(dir.join("cmd.out"))?, File::create(dir.join("cmd.err"))?))
    }

    pub fn console_path(&self, node: &str) -> io::Result<PathBuf> {
        Ok(self.node_dir(node)?.join("console"))
    }

    /// Remove the state of `node`; missing files are fine.
    pub fn remove_node(&self, node: &str) {
        let _ = std::fs::remove_file(self.root.join(node).join("nspid"));
        let _ = std::fs::remove_file(self.root.join(node).join("console"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let rd = RunDir::create(tmp.path().join("run")).unwrap();
        rd.write_nspid("r1", 4242).unwrap();
        assert_eq!(rd.read_nspid("r1"), Some(4242));
        assert_eq!(rd.read_nspid("r2"), None);

        let (mut out, _err) = rd.output_files("r1").unwrap();
        writeln!(out, "hello").unwrap();
        let text = std::fs::read_to_string(tmp.path().join("run/r1/cmd.out")).unwrap();
        assert_eq!(text, "hello\n");

        assert!(rd.console_path("vm1").unwrap().ends_with("vm1/console"));
        rd.remove_node("r1");
        assert_eq!(rd.read_nspid("r1"), None);
    }
}
