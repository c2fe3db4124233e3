pub mod keys;
pub mod wallet;

pub use keys::{PrivateKeyPair, PrivateSpendKey, PrivateViewKey, PublicKey, PublicKeyPair};
pub use wallet::WalletClient;
