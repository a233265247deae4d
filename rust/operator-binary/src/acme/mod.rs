//! Obtains certificates from an ACME certificate authority by solving DNS-01 challenges

pub mod dns;
pub mod propagation;

use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt, NewAccount, NewOrder,
    Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::time::{sleep, Instant};

use self::{
    dns::{Credentials, DnsChallengeProvider, TxtRecord},
    propagation::PropagationCheck,
};
use crate::{crd::DnsProviderCode, utils::Unloggable};

const CHALLENGE_LABEL: &str = "_acme-challenge";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to configure DNS provider {provider}"))]
    BuildProvider {
        source: dns::FromCodeError,
        provider: DnsProviderCode,
    },

    #[snafu(display("failed to register ACME account at {directory_url:?}"))]
    RegisterAccount {
        source: instant_acme::Error,
        directory_url: String,
    },

    #[snafu(display("failed to create order for {domain:?}"))]
    CreateOrder {
        source: instant_acme::Error,
        domain: String,
    },

    #[snafu(display("failed to fetch authorizations"))]
    FetchAuthorizations { source: instant_acme::Error },

    #[snafu(display("authorization for {identifier:?} is {status}"))]
    UnusableAuthorization { identifier: String, status: String },

    #[snafu(display("no DNS-01 challenge offered for {identifier:?}"))]
    NoDnsChallenge { identifier: String },

    #[snafu(display("failed to publish challenge record {fqdn:?}"))]
    PresentChallenge { source: dns::DynError, fqdn: String },

    #[snafu(display("challenge record did not propagate"))]
    Propagation { source: propagation::Error },

    #[snafu(display("failed to mark challenge as ready"))]
    SetChallengeReady { source: instant_acme::Error },

    #[snafu(display("failed to refresh order"))]
    RefreshOrder { source: instant_acme::Error },

    #[snafu(display("order for {domain:?} became invalid"))]
    OrderInvalid { domain: String },

    #[snafu(display("order for {domain:?} did not complete within {timeout:?}"))]
    OrderTimeout { domain: String, timeout: Duration },

    #[snafu(display("failed to generate certificate key"))]
    GenerateKey { source: rcgen::Error },

    #[snafu(display("failed to build certificate signing request"))]
    BuildCsr { source: rcgen::Error },

    #[snafu(display("failed to finalize order"))]
    Finalize { source: instant_acme::Error },

    #[snafu(display("failed to download certificate"))]
    DownloadCertificate { source: instant_acme::Error },
}

/// Settings shared by all certificate orders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeConfig {
    pub directory_url: String,
    pub propagation: PropagationCheck,
    /// Upper bound for the CA to validate the challenges and issue the certificate.
    pub order_timeout: Duration,
    pub order_poll_interval: Duration,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: LetsEncrypt::Production.url().to_string(),
            propagation: PropagationCheck::default(),
            order_timeout: Duration::from_secs(300),
            order_poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ObtainRequest<'a> {
    pub domain: &'a str,
    pub provider: DnsProviderCode,
    pub credentials: &'a Credentials,
    pub email: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCertificate {
    /// Full chain, leaf first.
    pub certificate_pem: String,
    pub private_key_pem: Unloggable<String>,
}

/// Anything that can turn an [`ObtainRequest`] into a certificate.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn obtain(&self, request: &ObtainRequest<'_>) -> Result<IssuedCertificate, Self::Error>;
}

/// The ACME account that a single order is placed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeIdentity {
    contact: Vec<String>,
}

impl AcmeIdentity {
    pub fn for_email(email: &str) -> Self {
        let email = email.trim();
        Self {
            contact: if email.is_empty() {
                Vec::new()
            } else {
                vec![format!("mailto:{email}")]
            },
        }
    }

    pub fn contact(&self) -> &[String] {
        &self.contact
    }

    /// Registers a new account with a freshly generated key.
    pub async fn register(&self, directory_url: &str) -> Result<Account, Error> {
        let contact = self.contact.iter().map(String::as_str).collect::<Vec<_>>();
        let (account, _credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await
        .context(RegisterAccountSnafu { directory_url })?;
        Ok(account)
    }
}

/// The name of the TXT record that proves control over `identifier`.
pub fn challenge_fqdn(identifier: &str) -> String {
    let identifier = identifier.trim_start_matches("*.").trim_end_matches('.');
    format!("{CHALLENGE_LABEL}.{identifier}")
}

/// [`CertificateAuthority`] talking to an ACME directory.
pub struct AcmeClient {
    config: AcmeConfig,
    http: reqwest::Client,
}

impl AcmeClient {
    pub fn new(config: AcmeConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    /// Publishes and verifies a DNS-01 proof for every pending authorization of `order`.
    ///
    /// Every published record is pushed to `presented`, also when a later step fails.
    async fn solve_challenges(
        &self,
        order: &mut Order,
        provider: &dns::Dynamic,
        presented: &mut Vec<TxtRecord>,
    ) -> Result<(), Error> {
        let authorizations = order
            .authorizations()
            .await
            .context(FetchAuthorizationsSnafu)?;
        let mut ready = Vec::new();
        for authz in &authorizations {
            let Identifier::Dns(identifier) = &authz.identifier;
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                ref status => {
                    return UnusableAuthorizationSnafu {
                        identifier,
                        status: format!("{status:?}"),
                    }
                    .fail()
                }
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .context(NoDnsChallengeSnafu { identifier })?;
            let fqdn = challenge_fqdn(identifier);
            let value = order.key_authorization(challenge).dns_value();
            tracing::info!(fqdn, "publishing challenge record");
            let record = provider
                .present(&fqdn, &value)
                .await
                .context(PresentChallengeSnafu { fqdn: &fqdn })?;
            presented.push(record);
            self.config
                .propagation
                .wait_for_txt(&fqdn, &value)
                .await
                .context(PropagationSnafu)?;
            ready.push(challenge.url.clone());
        }
        for url in &ready {
            order
                .set_challenge_ready(url)
                .await
                .context(SetChallengeReadySnafu)?;
        }
        Ok(())
    }

    async fn issue(&self, order: &mut Order, domain: &str) -> Result<IssuedCertificate, Error> {
        let deadline = Instant::now() + self.config.order_timeout;
        let timeout = || OrderTimeoutSnafu {
            domain,
            timeout: self.config.order_timeout,
        };

        loop {
            order.refresh().await.context(RefreshOrderSnafu)?;
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => return OrderInvalidSnafu { domain }.fail(),
                OrderStatus::Pending | OrderStatus::Processing => {}
            }
            snafu::ensure!(Instant::now() < deadline, timeout());
            sleep(self.config.order_poll_interval).await;
        }

        let key_pair = KeyPair::generate().context(GenerateKeySnafu)?;
        let mut params = CertificateParams::new(vec![domain.to_string()]).context(BuildCsrSnafu)?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params.serialize_request(&key_pair).context(BuildCsrSnafu)?;
        if order.state().status != OrderStatus::Valid {
            order.finalize(csr.der()).await.context(FinalizeSnafu)?;
        }

        let certificate_pem = loop {
            if let Some(chain) = order
                .certificate()
                .await
                .context(DownloadCertificateSnafu)?
            {
                break chain;
            }
            snafu::ensure!(Instant::now() < deadline, timeout());
            sleep(self.config.order_poll_interval).await;
        };
        Ok(IssuedCertificate {
            certificate_pem,
            private_key_pem: Unloggable(key_pair.serialize_pem()),
        })
    }
}

#[async_trait]
impl CertificateAuthority for AcmeClient {
    type Error = Error;

    #[tracing::instrument(
        skip(self, request),
        fields(domain = request.domain, provider = %request.provider)
    )]
    async fn obtain(&self, request: &ObtainRequest<'_>) -> Result<IssuedCertificate, Error> {
        let provider = dns::from_code(request.provider, request.credentials, &self.http).context(
            BuildProviderSnafu {
                provider: request.provider,
            },
        )?;
        let account = AcmeIdentity::for_email(request.email)
            .register(&self.config.directory_url)
            .await?;
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(request.domain.to_string())],
            })
            .await
            .context(CreateOrderSnafu {
                domain: request.domain,
            })?;

        let mut presented = Vec::new();
        let result = match self
            .solve_challenges(&mut order, provider.as_ref(), &mut presented)
            .await
        {
            Ok(()) => self.issue(&mut order, request.domain).await,
            Err(err) => Err(err),
        };
        for record in &presented {
            if let Err(err) = provider.cleanup(record).await {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    fqdn = record.fqdn,
                    "failed to remove challenge record"
                );
            }
        }
        if result.is_ok() {
            tracing::info!("certificate issued");
        }
        result
    }
}
