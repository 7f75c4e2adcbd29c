//! Operation records.
//!
//! One record per in-flight command. Records form an owning stack: a
//! command that needs pre-work (resolve the working directory, obtain a
//! lock) pushes a sub-record on top of itself and is resumed with the
//! sub-result when the top record completes. Destroying the top record
//! recursively destroys the chain.

use std::path::PathBuf;
use std::time::SystemTime;

use crate::command::Command;
use crate::path::RemotePath;

/// Per-command payload of an operation record.
#[derive(Debug)]
pub enum OpPayload {
    /// Commands that need no extra state here.
    Generic,
    /// Connection establishment.
    Connect(ConnectData),
    /// A file upload or download.
    Transfer(Box<FileTransferData>),
}

/// State of a connect command.
#[derive(Debug, Clone)]
pub struct ConnectData {
    pub host: String,
    pub port: u16,
}

/// State of a file transfer command.
#[derive(Debug, Clone)]
pub struct FileTransferData {
    pub local_file: PathBuf,
    pub remote_file: String,
    pub remote_path: RemotePath,
    pub download: bool,

    pub local_size: Option<u64>,
    pub remote_size: Option<u64>,
    pub remote_time: Option<SystemTime>,

    /// Address the remote file absolutely instead of via the CWD.
    pub try_absolute_path: bool,
    /// Continue the existing target from its current size.
    pub resume: bool,
    /// Bytes actually started moving (controls result messages and cache
    /// updates).
    pub transfer_initiated: bool,
    /// ASCII (text) mode transfer.
    pub ascii: bool,
}

impl FileTransferData {
    pub fn new(
        download: bool,
        local_file: impl Into<PathBuf>,
        remote_file: impl Into<String>,
        remote_path: RemotePath,
    ) -> FileTransferData {
        FileTransferData {
            local_file: local_file.into(),
            remote_file: remote_file.into(),
            remote_path,
            download,
            local_size: None,
            remote_size: None,
            remote_time: None,
            try_absolute_path: false,
            resume: false,
            transfer_initiated: false,
            ascii: false,
        }
    }
}

/// One stacked operation record.
#[derive(Debug)]
pub struct OpData {
    pub command: Command,
    /// Dialect-defined sub-state within the command.
    pub op_state: i32,
    /// The pushed-down record this one suspended.
    pub next: Option<Box<OpData>>,
    /// Parked on an async user request; suppresses the watchdog.
    pub wait_for_async_request: bool,
    /// This record accounts for one cache-lock hold.
    pub holds_lock: bool,
    pub payload: OpPayload,
}

impl OpData {
    pub fn new(command: Command) -> OpData {
        OpData {
            command,
            op_state: 0,
            next: None,
            wait_for_async_request: false,
            holds_lock: false,
            payload: OpPayload::Generic,
        }
    }

    pub fn connect(host: impl Into<String>, port: u16) -> OpData {
        OpData {
            payload: OpPayload::Connect(ConnectData { host: host.into(), port }),
            ..OpData::new(Command::Connect)
        }
    }

    pub fn transfer(data: FileTransferData) -> OpData {
        OpData {
            payload: OpPayload::Transfer(Box::new(data)),
            ..OpData::new(Command::Transfer)
        }
    }

    /// The transfer payload, if this is a transfer record.
    pub fn transfer_data(&self) -> Option<&FileTransferData> {
        match &self.payload {
            OpPayload::Transfer(data) => Some(data),
            _ => None,
        }
    }

    pub fn transfer_data_mut(&mut self) -> Option<&mut FileTransferData> {
        match &mut self.payload {
            OpPayload::Transfer(data) => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerKind;

    #[test]
    fn new_record_starts_clean() {
        let op = OpData::new(Command::List);
        assert_eq!(op.command, Command::List);
        assert_eq!(op.op_state, 0);
        assert!(op.next.is_none());
        assert!(!op.wait_for_async_request);
        assert!(!op.holds_lock);
    }

    #[test]
    fn transfer_record_exposes_payload() {
        let path = RemotePath::parse(ServerKind::Ftp, "/pub").unwrap();
        let mut op = OpData::transfer(FileTransferData::new(true, "/tmp/a.txt", "a.txt", path));
        assert_eq!(op.command, Command::Transfer);
        assert!(op.transfer_data().unwrap().download);
        op.transfer_data_mut().unwrap().resume = true;
        assert!(op.transfer_data().unwrap().resume);
    }

    #[test]
    fn generic_record_has_no_transfer_payload() {
        let op = OpData::new(Command::Mkdir);
        assert!(op.transfer_data().is_none());
    }
}
