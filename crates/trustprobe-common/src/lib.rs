mod error;
mod tls;

pub use error::HarnessError;
pub use tls::{
    install_crypto_provider, load_certs_from_pem, load_client_config,
    load_client_config_from_pem, load_private_key_from_pem, load_server_config,
    load_server_config_from_pem,
};
