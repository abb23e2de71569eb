//! Redis-backed persistence for the collaboration-room layer.
//!
//! Everything the relay core needs lives in memory; only rooms, their
//! participants, the session pool, shared panel state, and invitations are
//! durable. Records are JSON blobs in hashes keyed per room.

use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::auth::RoomUser;
use crate::protocol::{PanelSelection, PanelSide, PanelState};

pub type SharedStorage = Arc<Storage>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: String,
    pub owner_id: String,
    pub owner_login: String,
    pub created_at: u64,
    #[serde(default)]
    pub archived: bool,
}

impl RoomRecord {
    pub fn new(room_id: String, owner: &RoomUser) -> Self {
        Self {
            room_id,
            owner_id: owner.id.clone(),
            owner_login: owner.login.clone(),
            created_at: unix_now(),
            archived: false,
        }
    }
}

/// A session surfaced in a room, independent of who owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    pub session_id: String,
    pub added_by: String,
    pub added_by_login: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    pub added_at: u64,
    /// Last status observed by the broker ("online"/"offline"/"closed").
    #[serde(default)]
    pub last_status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    pub id: String,
    pub room_id: String,
    pub invitee_login: String,
    pub inviter_id: String,
    pub created_at: u64,
    pub status: InvitationStatus,
}

#[derive(Clone)]
pub struct Storage {
    redis: ConnectionManager,
}

impl Storage {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    pub async fn create_room(&self, room: &RoomRecord) -> Result<()> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(room)?;
        conn.set::<_, _, ()>(room_key(&room.room_id), value).await?;
        // The owner is always a participant.
        self.add_participant(
            &room.room_id,
            &RoomUser {
                id: room.owner_id.clone(),
                login: room.owner_login.clone(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(room_key(room_id)).await?;
        match value {
            Some(json) => {
                let room: RoomRecord = serde_json::from_str(&json)?;
                if room.archived {
                    Ok(None)
                } else {
                    Ok(Some(room))
                }
            }
            None => Ok(None),
        }
    }

    pub async fn archive_room(&self, room_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(room_key(room_id)).await?;
        if let Some(json) = value {
            let mut room: RoomRecord = serde_json::from_str(&json)?;
            room.archived = true;
            conn.set::<_, _, ()>(room_key(room_id), serde_json::to_string(&room)?)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------

    pub async fn is_room_member(&self, room_id: &str, user_id: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let member: bool = conn.hexists(participants_key(room_id), user_id).await?;
        Ok(member)
    }

    pub async fn add_participant(&self, room_id: &str, user: &RoomUser) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(participants_key(room_id), &user.id, &user.login)
            .await?;
        Ok(())
    }

    pub async fn list_participants(&self, room_id: &str) -> Result<Vec<RoomUser>> {
        let mut conn = self.redis.clone();
        let entries: std::collections::HashMap<String, String> =
            conn.hgetall(participants_key(room_id)).await?;
        Ok(entries
            .into_iter()
            .map(|(id, login)| RoomUser { id, login })
            .collect())
    }

    // ------------------------------------------------------------------
    // Session pool
    // ------------------------------------------------------------------

    pub async fn get_pool(&self, room_id: &str) -> Result<Vec<PoolEntry>> {
        let mut conn = self.redis.clone();
        let entries: std::collections::HashMap<String, String> = conn.hgetall(pool_key(room_id)).await?;
        let mut pool = Vec::with_capacity(entries.len());
        for (_, json) in entries {
            if let Ok(entry) = serde_json::from_str::<PoolEntry>(&json) {
                pool.push(entry);
            }
        }
        pool.sort_by_key(|entry| entry.added_at);
        Ok(pool)
    }

    pub async fn add_to_pool(&self, room_id: &str, entry: &PoolEntry) -> Result<()> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(entry)?;
        conn.hset::<_, _, _, ()>(pool_key(room_id), &entry.session_id, value)
            .await?;
        Ok(())
    }

    pub async fn remove_from_pool(&self, room_id: &str, session_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.hdel::<_, _, ()>(pool_key(room_id), session_id).await?;
        Ok(())
    }

    pub async fn mark_pool_session_closed(
        &self,
        room_id: &str,
        session_id: &str,
        graceful: bool,
    ) -> Result<()> {
        let status = if graceful { "closed" } else { "offline" };
        self.update_pool_status(room_id, session_id, status).await
    }

    pub async fn mark_pool_session_online(&self, room_id: &str, session_id: &str) -> Result<()> {
        self.update_pool_status(room_id, session_id, "online").await
    }

    async fn update_pool_status(
        &self,
        room_id: &str,
        session_id: &str,
        status: &str,
    ) -> Result<()> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.hget(pool_key(room_id), session_id).await?;
        if let Some(json) = value {
            let mut entry: PoolEntry = serde_json::from_str(&json)?;
            entry.last_status = Some(status.to_string());
            conn.hset::<_, _, _, ()>(pool_key(room_id), session_id, serde_json::to_string(&entry)?)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared panel state
    // ------------------------------------------------------------------

    pub async fn get_shared_panel_state(&self, room_id: &str) -> Result<PanelState> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(panels_key(room_id)).await?;
        match value {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
            None => Ok(PanelState::default()),
        }
    }

    pub async fn set_shared_panel_state(
        &self,
        room_id: &str,
        panel: PanelSide,
        selection: Option<PanelSelection>,
    ) -> Result<PanelState> {
        let mut state = self.get_shared_panel_state(room_id).await?;
        match panel {
            PanelSide::Left => state.left = selection,
            PanelSide::Right => state.right = selection,
        }
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(panels_key(room_id), serde_json::to_string(&state)?)
            .await?;
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Invitations
    // ------------------------------------------------------------------

    pub async fn create_invitation(&self, invitation: &Invitation) -> Result<()> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(invitation)?;
        conn.hset::<_, _, _, ()>(invites_key(&invitation.room_id), &invitation.id, value)
            .await?;
        Ok(())
    }

    pub async fn list_pending_invitations(&self, room_id: &str) -> Result<Vec<Invitation>> {
        let mut conn = self.redis.clone();
        let entries: std::collections::HashMap<String, String> = conn.hgetall(invites_key(room_id)).await?;
        let mut pending = Vec::new();
        for (_, json) in entries {
            if let Ok(invitation) = serde_json::from_str::<Invitation>(&json) {
                if invitation.status == InvitationStatus::Pending {
                    pending.push(invitation);
                }
            }
        }
        Ok(pending)
    }

    pub async fn pending_invitation_for(
        &self,
        room_id: &str,
        login: &str,
    ) -> Result<Option<Invitation>> {
        let pending = self.list_pending_invitations(room_id).await?;
        Ok(pending.into_iter().find(|i| i.invitee_login == login))
    }

    pub async fn accept_invitation(&self, room_id: &str, invitation_id: &str) -> Result<()> {
        self.update_invitation(room_id, invitation_id, InvitationStatus::Accepted)
            .await
    }

    pub async fn revoke_invitation(&self, room_id: &str, invitation_id: &str) -> Result<()> {
        self.update_invitation(room_id, invitation_id, InvitationStatus::Revoked)
            .await
    }

    async fn update_invitation(
        &self,
        room_id: &str,
        invitation_id: &str,
        status: InvitationStatus,
    ) -> Result<()> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.hget(invites_key(room_id), invitation_id).await?;
        if let Some(json) = value {
            let mut invitation: Invitation = serde_json::from_str(&json)?;
            invitation.status = status;
            conn.hset::<_, _, _, ()>(
                invites_key(room_id),
                invitation_id,
                serde_json::to_string(&invitation)?,
            )
            .await?;
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn room_key(room_id: &str) -> String {
    format!("jam:{}", room_id)
}

fn participants_key(room_id: &str) -> String {
    format!("jam:{}:participants", room_id)
}

fn pool_key(room_id: &str) -> String {
    format!("jam:{}:pool", room_id)
}

fn panels_key(room_id: &str) -> String {
    format!("jam:{}:panels", room_id)
}

fn invites_key(room_id: &str) -> String {
    format!("jam:{}:invites", room_id)
}
