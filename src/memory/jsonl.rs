//! Filesystem turn store.
//!
//! Each user's history lives in `{root}/{user_id}.jsonl`, one JSON object
//! per line, appended in turn order. Malformed lines are skipped on read so
//! a torn write at crash time costs one turn, not the whole history.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use super::store::TurnStore;
use super::types::ConversationTurn;
use crate::error::{Result, VoiceError};

/// Append-only JSONL turn store.
#[derive(Debug)]
pub struct JsonlTurnStore {
    root: PathBuf,
    /// Serialises appends so lines from concurrent saves never interleave.
    write_lock: Mutex<()>,
}

impl JsonlTurnStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Persistence`] if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            VoiceError::Persistence(format!(
                "failed to create turn directory {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Open the store at the default data location.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Persistence`] if the directory cannot be created.
    pub fn open_default() -> Result<Self> {
        Self::new(crate::voice_dirs::turns_dir())
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// History file for a user.
    ///
    /// Characters outside `[A-Za-z0-9_-]` are replaced so a user id can
    /// never name a path outside the root.
    pub fn user_file(&self, user_id: &str) -> Result<PathBuf> {
        let safe: String = user_id
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if safe.is_empty() {
            return Err(VoiceError::Persistence("user id is empty".into()));
        }
        Ok(self.root.join(format!("{safe}.jsonl")))
    }

    fn append(&self, turn: &ConversationTurn) -> Result<()> {
        let path = self.user_file(&turn.user_id)?;
        let mut line = serde_json::to_string(turn)
            .map_err(|e| VoiceError::Persistence(format!("failed to serialize turn: {e}")))?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| VoiceError::Persistence("turn store lock poisoned".into()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                VoiceError::Persistence(format!("failed to open {}: {e}", path.display()))
            })?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn read_tail(&self, user_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let path = self.user_file(user_id)?;
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VoiceError::Io(e)),
        };

        let mut tail: VecDeque<ConversationTurn> = VecDeque::with_capacity(limit);
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else {
                continue;
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ConversationTurn>(trimmed) {
                Ok(turn) => {
                    if tail.len() == limit {
                        let _ = tail.pop_front();
                    }
                    tail.push_back(turn);
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "skipping malformed turn line");
                }
            }
        }
        Ok(tail.into_iter().collect())
    }
}

#[async_trait]
impl TurnStore for JsonlTurnStore {
    async fn save_turn(&self, turn: &ConversationTurn) -> Result<()> {
        self.append(turn)
    }

    async fn load_recent_turns(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        self.read_tail(user_id, limit)
    }
}
