//! `systemd-nspawn` command lines.

use std::path::{Path, PathBuf};

use crate::process::CommandLine;

/// Where `systemd-nspawn -M` looks images up.
const NSPAWN_SEARCH_DIR: &str = "/var/lib/machines";

/// Builds the command that runs `program` inside an image.
#[derive(Debug, Clone, Default)]
pub struct NspawnCommand {
    binds: Vec<PathBuf>,
}

impl NspawnCommand {
    /// Bind-mount each of `binds` into the container.
    #[must_use]
    pub fn new(binds: Vec<PathBuf>) -> Self {
        Self { binds }
    }

    /// The bind-mounted host directories.
    #[must_use]
    pub fn binds(&self) -> &[PathBuf] {
        &self.binds
    }

    /// `systemd-nspawn --bind <dir>... -M <name> <program> <args>...`
    ///
    /// Images outside the nspawn search path are passed with `-D`.
    #[must_use]
    pub fn command<I, S>(&self, name: &str, image_path: &Path, program: &str, args: I) -> CommandLine
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString>,
    {
        let mut command = CommandLine::new("systemd-nspawn");
        for dir in &self.binds {
            command = command.path_arg("--bind", dir);
        }
        if image_path != Path::new(NSPAWN_SEARCH_DIR).join(name) {
            command = command.path_arg("-D", image_path);
        }
        command.arg("-M").arg(name).arg(program).args(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_location_uses_machine_name() {
        let nspawn = NspawnCommand::new(vec![PathBuf::from("/var/cache/pacman/pkg")]);
        let cmd = nspawn.command("web", Path::new("/var/lib/machines/web"), "pacman", ["-Syu"]);
        assert_eq!(
            cmd.to_string(),
            "systemd-nspawn --bind /var/cache/pacman/pkg -M web pacman -Syu"
        );
    }

    #[test]
    fn other_location_passes_directory() {
        let nspawn = NspawnCommand::default();
        let cmd = nspawn.command("web", Path::new("/srv/machines/web"), "true", Vec::<String>::new());
        assert_eq!(cmd.to_string(), "systemd-nspawn -D /srv/machines/web -M web true");
    }
}
