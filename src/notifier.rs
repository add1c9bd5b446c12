//! Background loops: certificate expiry notification and periodic CRL
//! refresh. Both follow the teacher daemon's shape — sleep, do the
//! work, log and continue on error, sleep again — rather than failing
//! the process on a single bad iteration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use time::OffsetDateTime;
use tracing::{error, info};

use crate::acme::AppState;
use crate::store::NotificationRow;

const NOTIFY_INTERVAL: StdDuration = StdDuration::from_secs(60 * 60);
const CRL_REBUILD_INTERVAL: StdDuration = StdDuration::from_secs(12 * 60 * 60);

pub async fn run_expiry_notifier_loop(state: Arc<AppState>) {
    loop {
        tokio::time::sleep(NOTIFY_INTERVAL).await;
        if let Err(err) = run_expiry_notifier_once(&state).await {
            error!("expiry notifier pass failed: {err}");
        }
    }
}

async fn run_expiry_notifier_once(state: &AppState) -> anyhow::Result<()> {
    let Some(mailer) = &state.mailer else {
        return Ok(());
    };
    let now = OffsetDateTime::now_utc();
    let rows = state.store.list_notifiable_certificates(now).await?;

    // Keep only the newest-expiring certificate per domain, so a
    // superseded certificate for the same name never re-triggers a
    // reminder after it's been replaced.
    let mut newest_per_domain: HashMap<String, NotificationRow> = HashMap::new();
    for row in rows {
        let domain = state
            .store
            .list_authorizations_for_order(&row.order.id)
            .await?
            .into_iter()
            .map(|a| a.domain)
            .next()
            .unwrap_or_default();
        newest_per_domain
            .entry(domain)
            .and_modify(|existing| {
                if row.certificate.not_valid_after > existing.certificate.not_valid_after {
                    *existing = row.clone();
                }
            })
            .or_insert(row);
    }

    for (domain, row) in newest_per_domain {
        let Some(contact) = &row.account.contact else {
            continue;
        };
        let Some(address) = contact.strip_prefix("mailto:") else {
            continue;
        };
        let expiring_soon = row.certificate.not_valid_after > now && !row.certificate.user_informed_cert_will_expire;
        let already_expired = row.certificate.not_valid_after <= now && !row.certificate.user_informed_cert_has_expired;

        if expiring_soon {
            mailer.send_cert_will_expire(address, &domain, row.certificate.not_valid_after).await;
            state
                .store
                .mark_certificate_notified(&row.certificate.serial_number, true, false)
                .await?;
            info!("notified {address} that certificate {} will expire soon", row.certificate.serial_number);
        } else if already_expired && state.settings.mail.notify_when_cert_expired {
            mailer.send_cert_has_expired(address, &domain, row.certificate.not_valid_after).await;
            state
                .store
                .mark_certificate_notified(&row.certificate.serial_number, false, true)
                .await?;
            info!("notified {address} that certificate {} has expired", row.certificate.serial_number);
        }
    }
    Ok(())
}

pub async fn run_crl_rebuild_loop(state: Arc<AppState>) {
    loop {
        tokio::time::sleep(CRL_REBUILD_INTERVAL).await;
        if let Err(err) = run_crl_rebuild_once(&state).await {
            error!("CRL rebuild pass failed: {err}");
        }
    }
}

async fn run_crl_rebuild_once(state: &AppState) -> anyhow::Result<()> {
    let key = crate::ca::fernet::parse_key(&state.settings.ca.encryption_key)?;
    for ca in state.store.list_cas().await? {
        let issuer = crate::ca::load_issuer(&ca, &key)?;
        let revoked = state.store.list_revoked_serials(&ca.serial_number).await?;
        let crl_pem = crate::ca::build_crl(&issuer, &revoked, state.crl_lifetime())?;
        state.store.update_ca_crl(&ca.serial_number, crl_pem).await?;
    }
    Ok(())
}
