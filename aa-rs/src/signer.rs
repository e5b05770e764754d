use async_trait::async_trait;
use ethers::signers::Signer;
use ethers::types::{Address, Bytes, H256};

use crate::error::Error;

/// Produces the account signature over a `userOpHash`.
///
/// Called fresh for every hash: any mutation of a hashed field invalidates the previous
/// signature.
#[async_trait]
pub trait OperationSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_hash(&self, hash: H256) -> Result<Bytes, Error>;
}

/// SimpleAccount convention: EIP-191 personal-message signature over the 32 hash bytes.
#[async_trait]
impl<S> OperationSigner for S
where
    S: Signer,
{
    fn address(&self) -> Address {
        Signer::address(self)
    }

    async fn sign_hash(&self, hash: H256) -> Result<Bytes, Error> {
        let sig = self
            .sign_message(hash.as_bytes())
            .await
            .map_err(|e| Error::Signing(e.to_string()))?;
        Ok(Bytes::from(sig.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::LocalWallet;
    use ethers::types::Signature;

    const KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[tokio::test]
    async fn signature_recovers_to_owner() {
        let wallet: LocalWallet = KEY.parse().unwrap();
        let hash = H256::repeat_byte(0x42);

        let sig = OperationSigner::sign_hash(&wallet, hash).await.unwrap();
        assert_eq!(sig.len(), 65);

        let parsed = Signature::try_from(sig.as_ref()).unwrap();
        let recovered = parsed.recover(hash.as_bytes()).unwrap();
        assert_eq!(recovered, OperationSigner::address(&wallet));
    }
}
