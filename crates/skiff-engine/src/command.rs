//! Command identifiers.

use std::fmt;

/// Identifies the kind of command an operation record executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Command {
    /// No command in progress.
    #[default]
    None,
    /// Establish the connection and log in.
    Connect,
    /// Retrieve a directory listing.
    List,
    /// Upload or download a file.
    Transfer,
    /// Delete remote files.
    Delete,
    /// Rename a remote file or directory.
    Rename,
    /// Create a remote directory.
    Mkdir,
    /// Remove a remote directory.
    Rmdir,
    /// Change remote permissions.
    Chmod,
    /// Send a raw protocol command.
    Raw,
    /// Change the remote working directory.
    Cwd,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::None => "none",
            Command::Connect => "connect",
            Command::List => "list",
            Command::Transfer => "transfer",
            Command::Delete => "delete",
            Command::Rename => "rename",
            Command::Mkdir => "mkdir",
            Command::Rmdir => "rmdir",
            Command::Chmod => "chmod",
            Command::Raw => "raw",
            Command::Cwd => "cwd",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_none() {
        assert_eq!(Command::default(), Command::None);
    }

    #[test]
    fn display_names_are_lowercase() {
        assert_eq!(Command::Transfer.to_string(), "transfer");
        assert_eq!(Command::Mkdir.to_string(), "mkdir");
    }
}
