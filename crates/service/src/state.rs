use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use iroh::Endpoint;
use url::Url;

use super::config::{Config, ConfigError};
use super::database::{Database, DatabaseSetupError};

use common::access::AccessEngine;
use common::contract::{ContractError, ServiceContract};
use common::crypto::{PublicKey, SecretKey};
use common::identity::{Authorities, Credential, CredentialVerifier};
use common::peer::{IrohPeerClient, PodHandler, PodProtocol};
use common::policy::PolicyRegistry;
use common::query::QueryDispatcher;

pub type PodDispatcher = QueryDispatcher<Database, IrohPeerClient>;
pub type PodMessageHandler = PodHandler<Database, IrohPeerClient>;

/// Main service state - one pod's storage, policy and transport
#[derive(Clone)]
pub struct State {
    secret: SecretKey,
    database: Database,
    endpoint: Endpoint,
    dispatcher: Arc<PodDispatcher>,
    handler: Arc<PodMessageHandler>,
    contract_paths: Vec<PathBuf>,
}

impl State {
    pub async fn from_config(config: &Config) -> Result<Self, StateSetupError> {
        // 1. Setup database
        let sqlite_database_url = match config.sqlite_path {
            Some(ref path) => {
                // the file is created if missing, its directory is not
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    if !parent.exists() {
                        return Err(StateSetupError::DatabasePathDoesNotExist);
                    }
                }
                Url::parse(&format!("sqlite://{}", path.display()))
                    .map_err(|_| StateSetupError::InvalidDatabaseUrl)
            }
            // otherwise just set up an in-memory database
            None => Url::parse("sqlite::memory:").map_err(|_| StateSetupError::InvalidDatabaseUrl),
        }?;
        tracing::info!("Database URL: {:?}", sqlite_database_url);
        let database = Database::connect(&sqlite_database_url).await?;

        // 2. Setup pod secret
        let secret = match config.key_path {
            Some(ref path) => load_or_create_key(path)?,
            None => SecretKey::generate(),
        };
        let id = secret.public();

        // 3. Publish contracts
        let registry = Arc::new(PolicyRegistry::new());
        for path in &config.contract_paths {
            let contract = load_contract(path)?;
            registry.publish(&contract)?;
        }

        // 4. Trusted authorities
        let names = &config.authorities;
        let pod_key = names.pod.public_key()?.unwrap_or(id);
        let mut verifier = CredentialVerifier::new().trust(names.pod.name.clone(), pod_key);
        if let Some(key) = names.service.public_key()? {
            verifier = verifier.trust(names.service.name.clone(), key);
        }
        if let Some(key) = names.network.public_key()? {
            verifier = verifier.trust(names.network.name.clone(), key);
        }
        let authorities = Authorities {
            pod_owner: id,
            pod: names.pod.name.clone(),
            service: names.service.name.clone(),
            network: names.network.name.clone(),
        };

        // 5. Our own membership credential
        let credential = match config.credential_path {
            Some(ref path) => Some(load_credential(path, &id)?),
            None => None,
        };

        // 6. Bind the pod endpoint
        let endpoint = common::peer::bind_endpoint(&secret, config.peer_listen_addr)
            .await
            .map_err(|e| StateSetupError::Endpoint(e.to_string()))?;

        // 7. Wire the dispatcher and the message handler
        let dispatcher = Arc::new(QueryDispatcher::new(
            registry,
            AccessEngine::new(authorities, config.precedence),
            database.clone(),
            IrohPeerClient::new(endpoint.clone(), credential),
            config.dispatcher()?,
        ));
        let handler = Arc::new(PodHandler::new(dispatcher.clone(), Arc::new(verifier)));

        tracing::info!("Pod id: {}", id);
        tracing::info!("Pod listening on: {:?}", endpoint.bound_sockets());

        Ok(Self {
            secret,
            database,
            endpoint,
            dispatcher,
            handler,
            contract_paths: config.contract_paths.clone(),
        })
    }

    pub fn id(&self) -> PublicKey {
        self.secret.public()
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn dispatcher(&self) -> &Arc<PodDispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        self.dispatcher.registry()
    }

    /// The iroh protocol handler serving this pod
    pub fn protocol(&self) -> PodProtocol<PodMessageHandler> {
        PodProtocol::new(self.handler.clone())
    }

    /// Re-read the configured contract files and publish any new versions
    ///
    /// Versions that are already published are skipped. A file that fails to load
    ///  or compile is logged and leaves the registry as it was. Returns the number
    ///  of versions published.
    pub fn reload_contracts(&self) -> usize {
        reload_contracts(self.registry(), &self.contract_paths)
    }
}

impl AsRef<Database> for State {
    fn as_ref(&self) -> &Database {
        &self.database
    }
}

pub fn load_contract(path: &Path) -> Result<ServiceContract, StateSetupError> {
    let json = fs::read_to_string(path).map_err(|e| StateSetupError::Io(path.into(), e))?;
    Ok(ServiceContract::from_json(&json)?)
}

pub(crate) fn reload_contracts(registry: &PolicyRegistry, paths: &[PathBuf]) -> usize {
    let mut published = 0;
    for path in paths {
        let contract = match load_contract(path) {
            Ok(contract) => contract,
            Err(e) => {
                tracing::warn!("failed to load contract {}: {}", path.display(), e);
                continue;
            }
        };
        match registry.publish(&contract) {
            Ok(_) => published += 1,
            Err(ContractError::VersionExists { .. }) => tracing::debug!(
                "contract {} version {} already published",
                contract.service_id,
                contract.version
            ),
            Err(e) => tracing::warn!("rejected contract {}: {}", path.display(), e),
        }
    }
    published
}

fn load_or_create_key(path: &Path) -> Result<SecretKey, StateSetupError> {
    if path.exists() {
        let pem = fs::read_to_string(path).map_err(|e| StateSetupError::Io(path.into(), e))?;
        return SecretKey::from_pem(&pem).map_err(|e| StateSetupError::InvalidKey(e.to_string()));
    }
    let key = SecretKey::generate();
    fs::write(path, key.to_pem()).map_err(|e| StateSetupError::Io(path.into(), e))?;
    tracing::info!("generated a new pod key at {}", path.display());
    Ok(key)
}

fn load_credential(path: &Path, id: &PublicKey) -> Result<Credential, StateSetupError> {
    let json = fs::read_to_string(path).map_err(|e| StateSetupError::Io(path.into(), e))?;
    let credential: Credential = serde_json::from_str(&json)
        .map_err(|e| StateSetupError::InvalidCredential(e.to_string()))?;
    if credential.subject != *id {
        return Err(StateSetupError::InvalidCredential(format!(
            "issued to {}, not to this pod",
            credential.subject
        )));
    }
    Ok(credential)
}

#[derive(Debug, thiserror::Error)]
pub enum StateSetupError {
    #[error("Database path does not exist")]
    DatabasePathDoesNotExist,
    #[error("Database setup error")]
    DatabaseSetupError(#[from] DatabaseSetupError),
    #[error("Invalid database URL")]
    InvalidDatabaseUrl,
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("invalid pod key: {0}")]
    InvalidKey(String),
    #[error("invalid pod credential: {0}")]
    InvalidCredential(String),
    #[error("invalid contract: {0}")]
    Contract(#[from] ContractError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind pod endpoint: {0}")]
    Endpoint(String),
}
