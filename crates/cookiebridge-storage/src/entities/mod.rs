pub mod credentials;
pub mod global_config;
pub mod profiles;

pub use credentials::Entity as Credentials;
pub use global_config::Entity as GlobalConfig;
pub use profiles::Entity as Profiles;
