use crate::error::ApiError;
use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use uuid::Uuid;
use vm_orchestrator::store::MachineStore;
use vm_orchestrator::{Account, AccountKind};

#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub account: Account,
    pub email: Option<String>,
}

/// Auth middleware - extracts the account from auth-proxy headers
///
/// The proxy in front of vm-api sets X-VM-User after verifying the user and
/// X-VM-Account-Kind to `administrator` or `client` (the default).
///
/// For local development without auth proxy, we fall back to x-user header.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let username = req
        .headers()
        .get("x-vm-user")
        .or_else(|| req.headers().get("x-forwarded-user")) // oauth2-proxy format
        .or_else(|| req.headers().get("x-user")) // fallback for dev
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let email = req
        .headers()
        .get("x-vm-email")
        .or_else(|| req.headers().get("x-forwarded-email"))
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    let kind = match req.headers().get("x-vm-account-kind") {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.parse::<AccountKind>().ok())
            .ok_or(StatusCode::BAD_REQUEST)?,
        None => AccountKind::Client,
    };

    // If no username, return 401
    let username = username.ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(AuthenticatedUser {
        account: Account { kind, id: username },
        email,
    });

    Ok(next.run(req).await)
}

/// Check that the user may see the machine
///
/// Returns ApiError::NotFound if the machine doesn't exist and
/// ApiError::Forbidden if it exists but is not visible to the user.
pub async fn check_machine_viewer(
    store: &MachineStore,
    machine_id: Uuid,
    user: &AuthenticatedUser,
) -> Result<(), ApiError> {
    store.require_owner(machine_id).await?;

    if !store.can_view(&user.account, machine_id).await? {
        return Err(ApiError::Forbidden(format!(
            "Access denied: machine {} is not visible to {}",
            machine_id, user.account
        )));
    }

    Ok(())
}

/// Check that the user owns the machine or is an administrator
pub async fn check_machine_manager(
    store: &MachineStore,
    machine_id: Uuid,
    user: &AuthenticatedUser,
) -> Result<(), ApiError> {
    let owner = store.require_owner(machine_id).await?;

    if !store.can_manage(&user.account, machine_id).await? {
        return Err(ApiError::Forbidden(format!(
            "Access denied: machine {} is owned by {}",
            machine_id, owner
        )));
    }

    Ok(())
}

pub fn require_administrator(user: &AuthenticatedUser) -> Result<(), ApiError> {
    if user.account.is_administrator() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Access denied: administrators only".to_string()))
    }
}
