//! Remote procedures.
//!
//! Each procedure runs inside the caller's transaction and touches several
//! tables at once. Either every write commits or none does.

use cadence_engine::clock::next_write_stamp;
use cadence_engine::{Record, Timestamp};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sqlx::PgConnection;

use super::rows::{count_rows, get_row, lock_table, upsert_row};
use crate::error::{AppError, Result};

/// Procedures this server knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procedure {
    AcceptInvitation,
    LeaveGroup,
    GroupMemberCount,
}

impl Procedure {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "accept_invitation" => Some(Procedure::AcceptInvitation),
            "leave_group" => Some(Procedure::LeaveGroup),
            "group_member_count" => Some(Procedure::GroupMemberCount),
            _ => None,
        }
    }

    /// Tables the procedure may write, in lock order.
    fn tables(self) -> &'static [&'static str] {
        match self {
            Procedure::AcceptInvitation => &["groups", "invitations", "memberships"],
            Procedure::LeaveGroup => &["groups", "memberships"],
            Procedure::GroupMemberCount => &[],
        }
    }
}

/// Result of a procedure and the tables whose feeds must be woken.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub result: Value,
    pub touched: Vec<&'static str>,
}

#[derive(Debug, Deserialize)]
struct AcceptInvitation {
    invitation_id: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct LeaveGroup {
    group_id: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct GroupMemberCount {
    group_id: String,
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| AppError::BadRequest(e.to_string()))
}

/// Run `procedure` on `conn`, which must be inside a transaction.
pub async fn run(
    conn: &mut PgConnection,
    procedure: Procedure,
    params: Value,
    now: Timestamp,
) -> Result<Outcome> {
    for table in procedure.tables() {
        lock_table(conn, table).await?;
    }

    match procedure {
        Procedure::AcceptInvitation => accept_invitation(conn, parse(params)?, now).await,
        Procedure::LeaveGroup => leave_group(conn, parse(params)?, now).await,
        Procedure::GroupMemberCount => group_member_count(conn, parse(params)?).await,
    }
}

fn membership_id(group_id: &str, user_id: &str) -> String {
    format!("{group_id}:{user_id}")
}

fn str_field<'a>(record: &'a Record, name: &str) -> Option<&'a str> {
    record.field(name).and_then(Value::as_str)
}

async fn live_row(conn: &mut PgConnection, table: &str, id: &str) -> Result<Option<Record>> {
    Ok(get_row(&mut *conn, table, id)
        .await?
        .map(|row| row.to_record())
        .filter(Record::is_active))
}

async fn accept_invitation(
    conn: &mut PgConnection,
    params: AcceptInvitation,
    now: Timestamp,
) -> Result<Outcome> {
    let mut invitation = live_row(conn, "invitations", &params.invitation_id)
        .await?
        .ok_or_else(|| AppError::validation("no such invitation"))?;

    let status = str_field(&invitation, "status").unwrap_or("pending");
    if status != "pending" {
        return Err(AppError::validation(format!("invitation already {status}")));
    }
    if let Some(invitee) = str_field(&invitation, "user_id") {
        if invitee != params.user_id {
            return Err(AppError::validation("invitation belongs to another user"));
        }
    }
    let group_id = str_field(&invitation, "group_id")
        .ok_or_else(|| AppError::validation("invitation has no group"))?
        .to_string();

    if live_row(conn, "groups", &group_id).await?.is_none() {
        return Err(AppError::validation("group no longer exists"));
    }

    let id = membership_id(&group_id, &params.user_id);
    let previous = get_row(&mut *conn, "memberships", &id).await?;
    if previous.as_ref().is_some_and(|row| !row.deleted) {
        return Err(AppError::constraint("already a member"));
    }

    invitation.fields.insert("status".into(), json!("accepted"));
    invitation.updated_at = next_write_stamp(now, Some(invitation.updated_at));
    upsert_row(&mut *conn, "invitations", &invitation).await?;

    let mut fields = Map::new();
    fields.insert("group_id".into(), json!(group_id));
    fields.insert("user_id".into(), json!(params.user_id));
    fields.insert("role".into(), json!("member"));
    let mut membership = Record::new(id.clone(), fields, now);
    membership.updated_at = next_write_stamp(now, previous.map(|row| row.updated_at.max(0) as u64));
    upsert_row(&mut *conn, "memberships", &membership).await?;

    tracing::info!(group_id = %group_id, user_id = %params.user_id, "invitation accepted");
    Ok(Outcome {
        result: json!({"membership_id": id, "group_id": group_id}),
        touched: vec!["invitations", "memberships"],
    })
}

async fn leave_group(conn: &mut PgConnection, params: LeaveGroup, now: Timestamp) -> Result<Outcome> {
    let id = membership_id(&params.group_id, &params.user_id);
    let mut membership = live_row(conn, "memberships", &id)
        .await?
        .ok_or_else(|| AppError::validation("not a member of this group"))?;

    membership.mark_deleted(next_write_stamp(now, Some(membership.updated_at)));
    upsert_row(&mut *conn, "memberships", &membership).await?;
    let mut touched = vec!["memberships"];

    let mut filter = Map::new();
    filter.insert("group_id".into(), json!(params.group_id));
    let remaining = count_rows(&mut *conn, "memberships", &filter).await?;

    // The last member leaving removes the group.
    let mut group_deleted = false;
    if remaining == 0 {
        if let Some(mut group) = live_row(conn, "groups", &params.group_id).await? {
            group.mark_deleted(next_write_stamp(now, Some(group.updated_at)));
            upsert_row(&mut *conn, "groups", &group).await?;
            touched.push("groups");
            group_deleted = true;
        }
    }

    tracing::info!(
        group_id = %params.group_id,
        user_id = %params.user_id,
        group_deleted,
        "left group"
    );
    Ok(Outcome {
        result: json!({"group_deleted": group_deleted, "remaining_members": remaining}),
        touched,
    })
}

async fn group_member_count(conn: &mut PgConnection, params: GroupMemberCount) -> Result<Outcome> {
    let mut filter = Map::new();
    filter.insert("group_id".into(), json!(params.group_id));
    let members = count_rows(&mut *conn, "memberships", &filter).await?;
    Ok(Outcome {
        result: json!({"group_id": params.group_id, "members": members}),
        touched: Vec::new(),
    })
}
