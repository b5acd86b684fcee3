// src/signer.rs
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, RecoveryMessage, Signature, H256};

use crate::error::{PaymasterError, PaymasterResult};
use crate::types::UserOperation;

/// How a wallet expects its owner signature to be produced and checked.
#[async_trait]
pub trait SignatureScheme: Send + Sync {
    async fn sign(&self, key: &LocalWallet, hash: H256) -> PaymasterResult<Bytes>;

    fn recover(&self, hash: H256, signature: &[u8]) -> PaymasterResult<Address>;
}

/// SimpleAccount style: the owner signs `toEthSignedMessageHash(userOpHash)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Eip191Scheme;

#[async_trait]
impl SignatureScheme for Eip191Scheme {
    async fn sign(&self, key: &LocalWallet, hash: H256) -> PaymasterResult<Bytes> {
        let signature = key
            .sign_message(hash.as_bytes())
            .await
            .map_err(|e| PaymasterError::Signing(e.to_string()))?;
        Ok(signature.to_vec().into())
    }

    fn recover(&self, hash: H256, signature: &[u8]) -> PaymasterResult<Address> {
        let signature = parse_signature(signature)?;
        signature
            .recover(RecoveryMessage::Data(hash.as_bytes().to_vec()))
            .map_err(|_| PaymasterError::SignatureMismatch)
    }
}

/// The owner signs the bare operation hash with no message prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawHashScheme;

#[async_trait]
impl SignatureScheme for RawHashScheme {
    async fn sign(&self, key: &LocalWallet, hash: H256) -> PaymasterResult<Bytes> {
        let signature = key
            .sign_hash(hash)
            .map_err(|e| PaymasterError::Signing(e.to_string()))?;
        Ok(signature.to_vec().into())
    }

    fn recover(&self, hash: H256, signature: &[u8]) -> PaymasterResult<Address> {
        let signature = parse_signature(signature)?;
        signature
            .recover(RecoveryMessage::Hash(hash))
            .map_err(|_| PaymasterError::SignatureMismatch)
    }
}

fn parse_signature(signature: &[u8]) -> PaymasterResult<Signature> {
    Signature::try_from(signature).map_err(|_| PaymasterError::SignatureMismatch)
}

/// Canonical operation hash bound to one entry point and chain.
#[derive(Debug, Clone, Copy)]
pub struct OperationHasher {
    pub entry_point: Address,
    pub chain_id: u64,
}

impl OperationHasher {
    pub fn new(entry_point: Address, chain_id: u64) -> Self {
        Self {
            entry_point,
            chain_id,
        }
    }

    pub fn hash(&self, op: &UserOperation) -> H256 {
        op.op_hash(self.entry_point, self.chain_id)
    }

    pub fn verify(
        &self,
        op: &UserOperation,
        owner: Address,
        scheme: &dyn SignatureScheme,
    ) -> PaymasterResult<()> {
        let recovered = scheme.recover(self.hash(op), &op.signature)?;
        if recovered != owner {
            return Err(PaymasterError::SignatureMismatch);
        }
        Ok(())
    }
}

/// Signs operations with a wallet owner's key.
pub struct OperationSigner<S> {
    key: LocalWallet,
    scheme: S,
    hasher: OperationHasher,
}

impl<S: SignatureScheme> OperationSigner<S> {
    pub fn new(key: LocalWallet, scheme: S, hasher: OperationHasher) -> Self {
        Self {
            key,
            scheme,
            hasher,
        }
    }

    pub fn owner(&self) -> Address {
        self.key.address()
    }

    pub fn hasher(&self) -> OperationHasher {
        self.hasher
    }

    pub async fn sign(&self, mut op: UserOperation) -> PaymasterResult<UserOperation> {
        let hash = self.hasher.hash(&op);
        op.signature = self.scheme.sign(&self.key, hash).await?;
        Ok(op)
    }

    pub fn verify(&self, op: &UserOperation) -> PaymasterResult<()> {
        self.hasher.verify(op, self.owner(), &self.scheme)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ethers::types::U256;

    // anvil account #0
    pub(crate) const OWNER_KEY: &str =
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    pub(crate) fn owner_key() -> LocalWallet {
        OWNER_KEY.parse().unwrap()
    }

    pub(crate) fn hasher() -> OperationHasher {
        OperationHasher::new(Address::repeat_byte(0xee), 31337)
    }

    fn sample_op() -> UserOperation {
        UserOperation {
            sender: Address::repeat_byte(0x01),
            nonce: 3.into(),
            call_data: vec![0xde, 0xad, 0xbe, 0xef].into(),
            call_gas_limit: 50_000.into(),
            verification_gas_limit: 100_000.into(),
            pre_verification_gas: 1_000_000.into(),
            max_fee_per_gas: 2_000_000_000u64.into(),
            max_priority_fee_per_gas: 1_000_000_000u64.into(),
            paymaster_and_data: vec![0xaa; 40].into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn eip191_sign_verify() {
        let signer = OperationSigner::new(owner_key(), Eip191Scheme, hasher());
        let op = signer.sign(sample_op()).await.unwrap();
        assert_eq!(op.signature.len(), 65);
        signer.verify(&op).unwrap();
    }

    #[tokio::test]
    async fn raw_hash_sign_verify() {
        let signer = OperationSigner::new(owner_key(), RawHashScheme, hasher());
        let op = signer.sign(sample_op()).await.unwrap();
        signer.verify(&op).unwrap();

        // schemes are not interchangeable
        assert_eq!(
            hasher().verify(&op, signer.owner(), &Eip191Scheme),
            Err(PaymasterError::SignatureMismatch)
        );
    }

    #[tokio::test]
    async fn hash_is_deterministic_and_ignores_signature() {
        let signer = OperationSigner::new(owner_key(), Eip191Scheme, hasher());
        let unsigned = sample_op();
        let signed = signer.sign(unsigned.clone()).await.unwrap();
        assert_eq!(hasher().hash(&unsigned), hasher().hash(&signed));
        let again = signer.sign(unsigned).await.unwrap();
        assert_eq!(signed.signature, again.signature);
    }

    #[tokio::test]
    async fn any_field_mutation_invalidates_signature() {
        let signer = OperationSigner::new(owner_key(), Eip191Scheme, hasher());
        let op = signer.sign(sample_op()).await.unwrap();

        let mutations: Vec<Box<dyn Fn(&mut UserOperation)>> = vec![
            Box::new(|op| op.sender.0[19] ^= 1),
            Box::new(|op| op.nonce = op.nonce ^ U256::one()),
            Box::new(|op| op.init_code = vec![1].into()),
            Box::new(|op| {
                let mut data = op.call_data.to_vec();
                data[0] ^= 1;
                op.call_data = data.into();
            }),
            Box::new(|op| op.call_gas_limit = op.call_gas_limit ^ U256::one()),
            Box::new(|op| op.verification_gas_limit = op.verification_gas_limit ^ U256::one()),
            Box::new(|op| op.pre_verification_gas = op.pre_verification_gas ^ U256::one()),
            Box::new(|op| op.max_fee_per_gas = op.max_fee_per_gas ^ U256::one()),
            Box::new(|op| {
                op.max_priority_fee_per_gas = op.max_priority_fee_per_gas ^ U256::one()
            }),
            Box::new(|op| {
                let mut data = op.paymaster_and_data.to_vec();
                data[39] ^= 1;
                op.paymaster_and_data = data.into();
            }),
        ];

        for (i, mutate) in mutations.iter().enumerate() {
            let mut mutated = op.clone();
            mutate(&mut mutated);
            assert_eq!(
                signer.verify(&mutated),
                Err(PaymasterError::SignatureMismatch),
                "mutation {i}"
            );
        }
    }

    #[tokio::test]
    async fn different_chain_or_entry_point_rejects() {
        let signer = OperationSigner::new(owner_key(), Eip191Scheme, hasher());
        let op = signer.sign(sample_op()).await.unwrap();
        let other_chain = OperationHasher::new(hasher().entry_point, 1);
        let other_entry_point = OperationHasher::new(Address::repeat_byte(0xef), 31337);
        assert!(other_chain.verify(&op, signer.owner(), &Eip191Scheme).is_err());
        assert!(other_entry_point
            .verify(&op, signer.owner(), &Eip191Scheme)
            .is_err());
    }

    #[test]
    fn garbage_signature_is_mismatch() {
        let op = UserOperation {
            signature: vec![1, 2, 3].into(),
            ..sample_op()
        };
        assert_eq!(
            hasher().verify(&op, Address::zero(), &Eip191Scheme),
            Err(PaymasterError::SignatureMismatch)
        );
    }
}
