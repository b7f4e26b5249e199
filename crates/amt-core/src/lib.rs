pub mod engine;
pub mod error;
pub mod kvm;
pub mod manager;
pub mod notify;
pub mod policy;
pub mod reconcile;
pub mod store;
pub mod timer;
pub mod wsman;

pub use engine::{EngineBinding, EngineInfo, LocalAccount, ProvisioningStatus, VersionInfo};
pub use error::{EngineError, StoreError, TunnelError};
pub use kvm::control::ControlSession;
pub use kvm::files::LocalFiles;
pub use kvm::platform::{Platform, SessionLocker, WorkstationLocker};
pub use kvm::KvmTunnel;
pub use manager::{AmtManager, Collaborators, ManagerConfig};
pub use notify::{AgentMessage, NotificationEvent, Notifier};
pub use policy::{BadPasswordAction, Policy, PolicyType};
pub use reconcile::activation::{activation_digest, generate_admin_password};
pub use reconcile::{EngineState, ListenerState, ReconcileConfig};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
