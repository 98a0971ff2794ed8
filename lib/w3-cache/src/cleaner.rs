/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::{BINARY_HEADER_LEN, EntryHeader};

pub const CLEANER_CMD_CREATED: u32 = 1;
pub const CLEANER_CMD_USED: u32 = 2;

const FILENAME_FIELD_LEN: usize = 40;
const CONNECT_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Best-effort statistics feed to the external cache cleaner process. One
/// fixed-size message per cache file close, fire-and-forget over a local
/// socket; if the cleaner cannot be reached even after spawning it, the
/// update is dropped and nobody cares.
pub struct CleanerNotifier {
    socket_path: PathBuf,
    spawn_argv: Option<Vec<String>>,
}

impl CleanerNotifier {
    pub fn new(socket_path: PathBuf, spawn_argv: Option<Vec<String>>) -> Self {
        CleanerNotifier {
            socket_path,
            spawn_argv,
        }
    }

    /// serialized tag + command code + fixed-width entry filename
    fn encode_message(header: &EntryHeader, command: u32, filename: &str) -> Vec<u8> {
        let mut msg = Vec::with_capacity(BINARY_HEADER_LEN + 4 + FILENAME_FIELD_LEN);
        msg.extend_from_slice(&header.encode());
        msg.extend_from_slice(&command.to_le_bytes());
        let mut name_field = [0u8; FILENAME_FIELD_LEN];
        let name = filename.as_bytes();
        let n = name.len().min(FILENAME_FIELD_LEN);
        name_field[..n].copy_from_slice(&name[..n]);
        msg.extend_from_slice(&name_field);
        msg
    }

    /// queue one notification; never blocks the caller and never fails it
    pub fn notify(&self, header: &EntryHeader, command: u32, filename: &str) {
        let msg = Self::encode_message(header, command, filename);
        let socket_path = self.socket_path.clone();
        let spawn_argv = self.spawn_argv.clone();
        tokio::spawn(async move {
            if let Err(e) = send_message(&socket_path, spawn_argv, &msg).await {
                debug!("cache cleaner unreachable, stats dropped: {e}");
            }
        });
    }
}

async fn send_message(
    socket_path: &std::path::Path,
    spawn_argv: Option<Vec<String>>,
    msg: &[u8],
) -> std::io::Result<()> {
    let mut spawned = false;
    for attempt in 0..CONNECT_ATTEMPTS {
        match UnixStream::connect(socket_path).await {
            Ok(mut stream) => {
                stream.write_all(msg).await?;
                // no reply is ever read
                return Ok(());
            }
            Err(e) => {
                if !spawned {
                    if let Some(argv) = &spawn_argv {
                        if let Some(cmd) = argv.first() {
                            let _ = std::process::Command::new(cmd).args(&argv[1..]).spawn();
                        }
                    }
                    spawned = true;
                }
                if attempt + 1 == CONNECT_ATTEMPTS {
                    return Err(e);
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
    unreachable!()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_layout() {
        let header = EntryHeader {
            use_count: 3,
            served_date: 10,
            last_modified: 20,
            expire_date: 30,
            payload_size: 40,
        };
        let name = "a".repeat(40);
        let msg = CleanerNotifier::encode_message(&header, CLEANER_CMD_CREATED, &name);
        assert_eq!(msg.len(), BINARY_HEADER_LEN + 4 + FILENAME_FIELD_LEN);
        assert_eq!(
            &msg[BINARY_HEADER_LEN..BINARY_HEADER_LEN + 4],
            &CLEANER_CMD_CREATED.to_le_bytes()
        );
        assert_eq!(&msg[BINARY_HEADER_LEN + 4..], name.as_bytes());
    }

    #[tokio::test]
    async fn delivered_when_listener_exists() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleaner.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let notifier = CleanerNotifier::new(path, None);
        notifier.notify(&EntryHeader::default(), CLEANER_CMD_USED, "abc");

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len(), BINARY_HEADER_LEN + 4 + FILENAME_FIELD_LEN);
    }

    #[test]
    fn unreachable_cleaner_is_not_fatal() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let notifier = CleanerNotifier::new(PathBuf::from("/nonexistent/cleaner.sock"), None);
            notifier.notify(&EntryHeader::default(), CLEANER_CMD_USED, "abc");
            // give the background task room to fail quietly
            tokio::time::sleep(Duration::from_millis(350)).await;
        });
    }
}
