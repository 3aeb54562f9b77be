//! Long-lived network services
//!
//! Services are started at most once per [`ServiceIdentity`], shared by
//! every caller that asks for the same identity, and torn down a grace
//! period after the last caller detaches.

mod binding;
mod detach;
mod identity;
mod registry;
mod spec;

pub use binding::{alias_env, AliasSet, Binding, ServiceBinding, ServiceBindings, ALIAS_ENV_PREFIX};
pub use detach::DetachScheduler;
pub use identity::{ClientId, ServiceHandle, ServiceIdentity};
pub use registry::{RegistrySettings, ServiceRecord, ServiceRegistry, ServiceState};
pub use spec::{NetworkProtocol, Port, ServiceSpec};
