//! Term and vote, persisted through the log storage metadata.

use bytes::Bytes;
use conductor_storage::{LogStorage, StorageNamespace};
use conductor_transport::MemberId;
use serde::{Deserialize, Serialize};

use crate::{RaftError, RaftResult};

const HARD_STATE_KEY: &str = "raft_hard_state";

/// State a member must never forget across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HardState {
    pub term: u64,
    pub voted_for: Option<MemberId>,
}

impl HardState {
    pub async fn load<S: LogStorage>(storage: &S, namespace: &StorageNamespace) -> RaftResult<Self> {
        match storage.get_metadata(namespace, HARD_STATE_KEY).await? {
            Some(bytes) => {
                ciborium::from_reader(bytes.as_ref()).map_err(|e| RaftError::Codec(e.to_string()))
            }
            None => Ok(Self::default()),
        }
    }

    pub async fn store<S: LogStorage>(
        &self,
        storage: &S,
        namespace: &StorageNamespace,
    ) -> RaftResult<()> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| RaftError::Codec(e.to_string()))?;
        storage
            .set_metadata(namespace, HARD_STATE_KEY, Bytes::from(buf))
            .await?;
        Ok(())
    }
}
