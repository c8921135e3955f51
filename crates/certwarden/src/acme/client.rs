//! `instant-acme` backed certificate issuer
//!
//! One [`CertificateIssuer::obtain`] call places one order for every name of
//! a group, answers the HTTP-01 challenges through the shared
//! [`ChallengeManager`], and finalizes with a freshly generated key. When
//! the order fails, the authorizations are re-read so that the failure can
//! be reported per name.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, KeyPair};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::account::{AccountIdentity, Registration};
use super::challenge::ChallengeManager;
use super::error::{AcmeError, IssueFailure};
use super::issuer::{CertificateIssuer, IssuedCertificate};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Upper bound for validation plus issuance of one order
const ORDER_TIMEOUT: Duration = Duration::from_secs(180);

/// Delay between order status polls
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// ACME client bound to one account
pub struct AcmeClient {
    account: Account,
    challenges: ChallengeManager,
    directory_url: String,
}

impl AcmeClient {
    /// Restore the account for `directory_url`, registering it if needed
    ///
    /// Returns `true` alongside the client when `identity` gained a new
    /// registration that must be saved.
    pub async fn connect(
        directory_url: &str,
        identity: &mut AccountIdentity,
        challenges: ChallengeManager,
    ) -> Result<(Self, bool), AcmeError> {
        if identity.is_registered_with(directory_url) {
            return Ok((Self::restore(identity, challenges).await?, false));
        }

        if let Some(registration) = &identity.registration {
            warn!(
                registered = %registration.directory_url,
                configured = %directory_url,
                "Stored account belongs to another ACME directory, registering again"
            );
        }

        let email = identity
            .email
            .clone()
            .ok_or_else(|| AcmeError::Account("no contact email configured".to_string()))?;
        let client = Self::register(directory_url, &email, identity, challenges).await?;
        Ok((client, true))
    }

    /// Register a new account, agreeing to the terms of service
    ///
    /// On success the registration is recorded in `identity`; the caller
    /// persists it.
    pub async fn register(
        directory_url: &str,
        email: &str,
        identity: &mut AccountIdentity,
        challenges: ChallengeManager,
    ) -> Result<Self, AcmeError> {
        info!(email = %email, directory = %directory_url, "Registering ACME account");

        let contact = format!("mailto:{email}");
        let new_account = NewAccount {
            contact: &[&contact],
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) = Account::create(&new_account, directory_url, None)
            .await
            .map_err(|e| AcmeError::Account(format!("registration failed: {e}")))?;

        let credentials = serde_json::to_value(&credentials)
            .map_err(|e| AcmeError::Account(format!("failed to serialize credentials: {e}")))?;

        identity.email = Some(email.to_string());
        identity.registration = Some(Registration {
            account_url: account.id().to_string(),
            directory_url: directory_url.to_string(),
            registered_at: Utc::now(),
            credentials,
        });

        info!(account_url = %account.id(), "Registered ACME account and agreed to terms of service");

        Ok(Self {
            account,
            challenges,
            directory_url: directory_url.to_string(),
        })
    }

    /// Restore a previously registered account
    pub async fn restore(
        identity: &AccountIdentity,
        challenges: ChallengeManager,
    ) -> Result<Self, AcmeError> {
        let registration = identity
            .registration
            .as_ref()
            .ok_or_else(|| AcmeError::Account("account is not registered".to_string()))?;

        let credentials: AccountCredentials =
            serde_json::from_value(registration.credentials.clone())
                .map_err(|e| AcmeError::Account(format!("stored credentials unusable: {e}")))?;

        let account = Account::from_credentials(credentials)
            .await
            .map_err(|e| AcmeError::Account(format!("failed to restore account: {e}")))?;

        debug!(account_url = %registration.account_url, "Restored ACME account");

        Ok(Self {
            account,
            challenges,
            directory_url: registration.directory_url.clone(),
        })
    }

    /// Place and complete an order, registering challenge tokens in `tokens`
    async fn run_order(
        &self,
        domains: &[String],
        tokens: &mut Vec<String>,
    ) -> Result<IssuedCertificate, IssueFailure> {
        let start = Instant::now();
        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();

        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| IssueFailure::for_all(domains, AcmeError::OrderCreation(e.to_string())))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| IssueFailure::for_all(domains, AcmeError::Challenge(e.to_string())))?;

        let mut failure = IssueFailure::default();
        for auth in &authorizations {
            let name = identifier_name(&auth.identifier);
            match auth.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => {
                    failure
                        .failures
                        .insert(name, format!("authorization is {status:?}"));
                    continue;
                }
            }

            let Some(challenge) = auth
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
            else {
                failure
                    .failures
                    .insert(name, "no HTTP-01 challenge offered".to_string());
                continue;
            };

            let key_authorization = order.key_authorization(challenge);
            self.challenges
                .add_challenge(&challenge.token, key_authorization.as_str());
            tokens.push(challenge.token.clone());

            if let Err(e) = order.set_challenge_ready(&challenge.url).await {
                failure.failures.insert(name, e.to_string());
            }
        }
        if !failure.failures.is_empty() {
            return Err(failure);
        }

        self.wait_for_ready(&mut order, domains, start).await?;

        let key_pair = KeyPair::generate()
            .map_err(|e| IssueFailure::for_all(domains, AcmeError::Finalize(e.to_string())))?;
        let csr = CertificateParams::new(domains.to_vec())
            .and_then(|params| params.serialize_request(&key_pair))
            .map_err(|e| IssueFailure::for_all(domains, AcmeError::Finalize(e.to_string())))?;

        order
            .finalize(csr.der())
            .await
            .map_err(|e| IssueFailure::for_all(domains, AcmeError::Finalize(e.to_string())))?;

        let chain = loop {
            if start.elapsed() > ORDER_TIMEOUT {
                return Err(IssueFailure::for_all(
                    domains,
                    AcmeError::Timeout("certificate was not issued in time".to_string()),
                ));
            }

            match order.certificate().await {
                Ok(Some(chain)) => break chain,
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    return Err(IssueFailure::for_all(
                        domains,
                        AcmeError::Finalize(e.to_string()),
                    ))
                }
            }
        };

        let (certificate_pem, issuer_certificate_pem) =
            split_chain(&chain).map_err(|e| IssueFailure::for_all(domains, e))?;

        info!(
            domains = ?domains,
            elapsed_secs = start.elapsed().as_secs(),
            "Certificate issued"
        );

        Ok(IssuedCertificate {
            private_key_pem: key_pair.serialize_pem(),
            certificate_pem,
            issuer_certificate_pem,
        })
    }

    /// Poll until the order is ready for finalization
    async fn wait_for_ready(
        &self,
        order: &mut Order,
        domains: &[String],
        start: Instant,
    ) -> Result<(), IssueFailure> {
        loop {
            if start.elapsed() > ORDER_TIMEOUT {
                return Err(IssueFailure::for_all(
                    domains,
                    AcmeError::Timeout("challenges were not validated in time".to_string()),
                ));
            }

            let status = order
                .refresh()
                .await
                .map_err(|e| IssueFailure::for_all(domains, AcmeError::Challenge(e.to_string())))?
                .status;
            debug!(domains = ?domains, status = ?status, "Order status");

            match status {
                OrderStatus::Ready => return Ok(()),
                OrderStatus::Pending | OrderStatus::Processing => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                OrderStatus::Valid => {
                    // The key for an already finalized order is unknown here
                    return Err(IssueFailure::for_all(
                        domains,
                        AcmeError::Finalize("order was already finalized".to_string()),
                    ));
                }
                OrderStatus::Invalid => return Err(self.invalid_order_failure(order, domains).await),
            }
        }
    }

    /// Work out which names caused an order to become invalid
    async fn invalid_order_failure(&self, order: &mut Order, domains: &[String]) -> IssueFailure {
        let order_error = order
            .state()
            .error
            .as_ref()
            .map(|problem| problem.to_string())
            .unwrap_or_else(|| "order became invalid".to_string());

        let mut failure = IssueFailure::default();
        match order.authorizations().await {
            Ok(authorizations) => {
                for auth in authorizations
                    .iter()
                    .filter(|a| a.status == AuthorizationStatus::Invalid)
                {
                    let reason = auth
                        .challenges
                        .iter()
                        .find_map(|c| c.error.as_ref())
                        .map(|problem| problem.to_string())
                        .unwrap_or_else(|| order_error.clone());
                    failure
                        .failures
                        .insert(identifier_name(&auth.identifier), reason);
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch authorizations of invalid order");
            }
        }

        if failure.failures.is_empty() {
            IssueFailure::for_all(domains, AcmeError::Challenge(order_error))
        } else {
            failure
        }
    }
}

#[async_trait]
impl CertificateIssuer for AcmeClient {
    async fn obtain(&self, domains: &[String]) -> Result<IssuedCertificate, IssueFailure> {
        info!(domains = ?domains, directory = %self.directory_url, "Requesting certificate");

        let mut tokens = Vec::new();
        let result = self.run_order(domains, &mut tokens).await;

        for token in &tokens {
            self.challenges.remove_challenge(token);
        }

        result
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("account", &self.account.id())
            .field("directory_url", &self.directory_url)
            .field("pending_challenges", &self.challenges.pending_count())
            .finish()
    }
}

fn identifier_name(identifier: &Identifier) -> String {
    match identifier {
        Identifier::Dns(name) => name.clone(),
        #[allow(unreachable_patterns)]
        other => format!("{other:?}"),
    }
}

/// Split a PEM chain into the leaf and the remaining issuer certificates
pub fn split_chain(chain: &str) -> Result<(String, String), AcmeError> {
    let blocks = pem::parse_many(chain).map_err(|e| AcmeError::Chain(e.to_string()))?;

    let mut certificates = blocks.into_iter().filter(|p| p.tag() == "CERTIFICATE");
    let leaf = certificates
        .next()
        .ok_or_else(|| AcmeError::Chain("no certificate in chain".to_string()))?;
    let issuers: Vec<pem::Pem> = certificates.collect();
    if issuers.is_empty() {
        return Err(AcmeError::Chain("chain has no issuer certificate".to_string()));
    }

    let config = pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF);
    Ok((
        pem::encode_config(&leaf, config),
        pem::encode_many_config(&issuers, config),
    ))
}
