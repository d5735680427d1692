//! Ownership and assignment edges in the relational store.
//!
//! The domain description held by the hypervisor is the source of truth for a
//! machine; the store only records who owns it and which clients were granted
//! access. Owner edges live in one table per [`AccountKind`], and every
//! operation on them goes through that kind's [`OwnerStatements`].

use crate::error::{OrchestratorError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Administrator,
    Client,
}

/// SQL for one owner table.
#[derive(Debug)]
pub struct OwnerStatements {
    pub get: &'static str,
    pub create: &'static str,
    pub modify: &'static str,
    pub delete: &'static str,
    pub list: &'static str,
}

const ADMINISTRATOR_STATEMENTS: OwnerStatements = OwnerStatements {
    get: "SELECT administrator_id FROM administrator_machines WHERE machine_id = ?",
    create: "INSERT INTO administrator_machines (machine_id, administrator_id, created_at)
             VALUES (?, ?, ?)",
    modify: "UPDATE administrator_machines SET administrator_id = ? WHERE machine_id = ?",
    delete: "DELETE FROM administrator_machines WHERE machine_id = ?",
    list: "SELECT machine_id FROM administrator_machines WHERE administrator_id = ?
           ORDER BY created_at, machine_id",
};

const CLIENT_STATEMENTS: OwnerStatements = OwnerStatements {
    get: "SELECT client_id FROM client_machines WHERE machine_id = ?",
    create: "INSERT INTO client_machines (machine_id, client_id, created_at) VALUES (?, ?, ?)",
    modify: "UPDATE client_machines SET client_id = ? WHERE machine_id = ?",
    delete: "DELETE FROM client_machines WHERE machine_id = ?",
    list: "SELECT machine_id FROM client_machines WHERE client_id = ?
           ORDER BY created_at, machine_id",
};

impl AccountKind {
    pub const ALL: [AccountKind; 2] = [AccountKind::Administrator, AccountKind::Client];

    pub fn as_str(self) -> &'static str {
        match self {
            AccountKind::Administrator => "administrator",
            AccountKind::Client => "client",
        }
    }

    pub fn statements(self) -> &'static OwnerStatements {
        match self {
            AccountKind::Administrator => &ADMINISTRATOR_STATEMENTS,
            AccountKind::Client => &CLIENT_STATEMENTS,
        }
    }
}

impl FromStr for AccountKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "administrator" | "admin" => Ok(AccountKind::Administrator),
            "client" => Ok(AccountKind::Client),
            other => Err(OrchestratorError::InvalidInput(format!(
                "unknown account kind: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Account {
    pub kind: AccountKind,
    pub id: String,
}

impl Account {
    pub fn administrator(id: impl Into<String>) -> Self {
        Self {
            kind: AccountKind::Administrator,
            id: id.into(),
        }
    }

    pub fn client(id: impl Into<String>) -> Self {
        Self {
            kind: AccountKind::Client,
            id: id.into(),
        }
    }

    pub fn is_administrator(&self) -> bool {
        self.kind == AccountKind::Administrator
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// `"<kind>:<id>"`; a bare id is a client.
impl FromStr for Account {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, id) = match s.split_once(':') {
            Some((kind, id)) => (kind.parse()?, id),
            None => (AccountKind::Client, s),
        };
        if id.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput("account id must not be empty".into()));
        }
        Ok(Account {
            kind,
            id: id.to_string(),
        })
    }
}

fn parse_ids(rows: Vec<String>) -> Result<Vec<Uuid>> {
    rows.into_iter()
        .map(|raw| {
            raw.parse::<Uuid>().map_err(|_| {
                OrchestratorError::InvalidInput(format!("stored machine id is not a UUID: {}", raw))
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct MachineStore {
    pool: SqlitePool,
}

impl MachineStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Inserts the owner edge and one assignment edge per client inside `tx`.
    pub async fn insert_edges(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        machine_id: Uuid,
        owner: &Account,
        assigned_clients: &BTreeSet<String>,
    ) -> Result<()> {
        let id = machine_id.to_string();
        sqlx::query(owner.kind.statements().create)
            .bind(&id)
            .bind(&owner.id)
            .bind(Utc::now().timestamp())
            .execute(&mut **tx)
            .await?;

        for client in assigned_clients {
            sqlx::query("INSERT INTO machine_assignments (machine_id, client_id) VALUES (?, ?)")
                .bind(&id)
                .bind(client)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    /// Removes every edge of the machine in one transaction. Returns the
    /// number of rows removed.
    #[instrument(skip(self), fields(machine_id = %machine_id))]
    pub async fn delete_edges(&self, machine_id: Uuid) -> Result<u64> {
        let id = machine_id.to_string();
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;

        for kind in AccountKind::ALL {
            removed += sqlx::query(kind.statements().delete)
                .bind(&id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        removed += sqlx::query("DELETE FROM machine_assignments WHERE machine_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        debug!(removed, "Deleted machine edges");
        Ok(removed)
    }

    pub async fn owner(&self, machine_id: Uuid) -> Result<Option<Account>> {
        let id = machine_id.to_string();
        for kind in AccountKind::ALL {
            let owner: Option<String> = sqlx::query_scalar(kind.statements().get)
                .bind(&id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(owner) = owner {
                return Ok(Some(Account { kind, id: owner }));
            }
        }
        Ok(None)
    }

    /// Owner of a machine that must exist.
    pub async fn require_owner(&self, machine_id: Uuid) -> Result<Account> {
        self.owner(machine_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(machine_id.to_string()))
    }

    pub async fn assigned_clients(&self, machine_id: Uuid) -> Result<BTreeSet<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT client_id FROM machine_assignments WHERE machine_id = ? ORDER BY client_id",
        )
        .bind(machine_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn owned_machines(&self, account: &Account) -> Result<Vec<Uuid>> {
        let rows: Vec<String> = sqlx::query_scalar(account.kind.statements().list)
            .bind(&account.id)
            .fetch_all(&self.pool)
            .await?;
        parse_ids(rows)
    }

    pub async fn all_machines(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT machine_id FROM administrator_machines
             UNION SELECT machine_id FROM client_machines
             ORDER BY machine_id",
        )
        .fetch_all(&self.pool)
        .await?;
        parse_ids(rows)
    }

    /// Administrators see every machine; clients see what they own plus what
    /// they were assigned.
    pub async fn visible_machines(&self, account: &Account) -> Result<Vec<Uuid>> {
        match account.kind {
            AccountKind::Administrator => self.all_machines().await,
            AccountKind::Client => {
                let rows: Vec<String> = sqlx::query_scalar(
                    "SELECT machine_id FROM client_machines WHERE client_id = ?
                     UNION SELECT machine_id FROM machine_assignments WHERE client_id = ?
                     ORDER BY machine_id",
                )
                .bind(&account.id)
                .bind(&account.id)
                .fetch_all(&self.pool)
                .await?;
                parse_ids(rows)
            }
        }
    }

    pub async fn can_view(&self, account: &Account, machine_id: Uuid) -> Result<bool> {
        let Some(owner) = self.owner(machine_id).await? else {
            return Ok(false);
        };
        if account.is_administrator() || owner == *account {
            return Ok(true);
        }
        if account.kind != AccountKind::Client {
            return Ok(false);
        }
        Ok(self.assigned_clients(machine_id).await?.contains(&account.id))
    }

    /// Owners and administrators may manage a machine.
    pub async fn can_manage(&self, account: &Account, machine_id: Uuid) -> Result<bool> {
        let owner = self.require_owner(machine_id).await?;
        Ok(account.is_administrator() || owner == *account)
    }

    pub async fn group_members(&self, group_id: &str) -> Result<Vec<String>> {
        let members = sqlx::query_scalar(
            "SELECT client_id FROM group_members WHERE group_id = ? ORDER BY client_id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    pub async fn add_group_member(&self, group_id: &str, client_id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO group_members (group_id, client_id) VALUES (?, ?)")
            .bind(group_id)
            .bind(client_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moves the owner edge to `new_owner`, across tables when the account
    /// kind changes.
    #[instrument(skip(self), fields(machine_id = %machine_id, new_owner = %new_owner))]
    pub async fn transfer_owner(&self, machine_id: Uuid, new_owner: &Account) -> Result<Account> {
        let current = self.require_owner(machine_id).await?;
        let id = machine_id.to_string();
        let mut tx = self.pool.begin().await?;

        if current.kind == new_owner.kind {
            sqlx::query(new_owner.kind.statements().modify)
                .bind(&new_owner.id)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(current.kind.statements().delete)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(new_owner.kind.statements().create)
                .bind(&id)
                .bind(&new_owner.id)
                .bind(Utc::now().timestamp())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(current)
    }
}
