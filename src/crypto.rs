use blst::min_sig::{
    AggregateSignature, PublicKey as BlstPublicKey, SecretKey, Signature as BlstSignature,
};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// A Hash type (32 bytes), typically SHA-256.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Validator address: the first 20 bytes of SHA-256 over the public key.
/// Messages are routed and votes are attributed by address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_public_key(pub_key: &PublicKey) -> Self {
        let digest = Sha256::digest(pub_key.0.to_bytes());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[..20]);
        Address(bytes)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// -----------------------------------------------------------------------------
// BLS Cryptography Implementation (using blst::min_sig)
// min_sig: Signatures in G1 (48 bytes), Public Keys in G2 (96 bytes).
// Votes are the most frequent message, so the smaller signature wins.
// -----------------------------------------------------------------------------

/// BLS Public Key (96 bytes).
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(pub BlstPublicKey);

impl PublicKey {
    pub fn address(&self) -> Address {
        Address::from_public_key(self)
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bytes().hash(state);
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes = self.0.to_bytes();
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let pk = BlstPublicKey::from_bytes(&bytes)
            .map_err(|e| serde::de::Error::custom(format!("{:?}", e)))?;
        Ok(PublicKey(pk))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pub({})", hex::encode(self.0.compress()))
    }
}

/// BLS Private Key.
#[derive(Clone)]
pub struct PrivateKey(pub SecretKey);

impl PrivateKey {
    /// Generate a new random Private Key.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut ikm = [0u8; 32];
        rng.fill_bytes(&mut ikm);
        PrivateKey(key_from_ikm(&ikm))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.sk_to_pk())
    }
}

fn key_from_ikm(ikm: &[u8; 32]) -> SecretKey {
    // key_gen only rejects input key material shorter than 32 bytes.
    SecretKey::key_gen(ikm, &[]).expect("32 bytes of ikm is always accepted")
}

/// BLS Signature (48 bytes).
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub BlstSignature);

impl std::hash::Hash for Signature {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bytes().hash(state);
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes = self.0.to_bytes();
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let sig = BlstSignature::from_bytes(&bytes)
            .map_err(|e| serde::de::Error::custom(format!("{:?}", e)))?;
        Ok(Signature(sig))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({})", hex::encode(self.0.compress()))
    }
}

/// Domain separation tag for every consensus signature.
const DST: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_POP_";

pub fn sign(priv_key: &PrivateKey, message: &[u8]) -> Signature {
    Signature(priv_key.0.sign(message, DST, &[]))
}

/// Verifies a signature.
pub fn verify(pub_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    let err = signature
        .0
        .verify(true, message, DST, &[], &pub_key.0, true);
    err == blst::BLST_ERROR::BLST_SUCCESS
}

/// Helper to hash any serializable object
pub fn hash_data<T: Serialize>(data: &T) -> Hash {
    let serialized = serde_json::to_vec(data).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    let result = hasher.finalize();
    Hash(result.into())
}

/// Generate a KeyPair (Public, Private).
pub fn generate_keypair() -> (PublicKey, PrivateKey) {
    let sk = PrivateKey::generate();
    let pk = sk.public_key();
    (pk, sk)
}

/// Aggregates multiple signatures into a single signature.
pub fn aggregate(signatures: &[Signature]) -> Option<Signature> {
    if signatures.is_empty() {
        return None;
    }
    let sig_refs: Vec<&BlstSignature> = signatures.iter().map(|s| &s.0).collect();
    match AggregateSignature::aggregate(&sig_refs, true) {
        Ok(agg) => Some(Signature(agg.to_signature())),
        Err(_) => None,
    }
}

/// Verifies an aggregated signature against a list of public keys for a single message.
/// This uses FastAggregateVerify optimization (all signers signed the same message).
pub fn verify_aggregate(pub_keys: &[PublicKey], message: &[u8], signature: &Signature) -> bool {
    if pub_keys.is_empty() {
        return false;
    }
    let pk_refs: Vec<&BlstPublicKey> = pub_keys.iter().map(|pk| &pk.0).collect();
    let err = signature
        .0
        .fast_aggregate_verify(true, message, DST, &pk_refs);
    err == blst::BLST_ERROR::BLST_SUCCESS
}

/// Generate a KeyPair from a u64 ID (deterministic).
/// Useful for static validator sets where keys are derived from IDs.
pub fn generate_keypair_from_id(id: u64) -> (PublicKey, PrivateKey) {
    let mut ikm = [0u8; 32];
    ikm[24..32].copy_from_slice(&id.to_be_bytes());
    let sk = key_from_ikm(&ikm);
    let pk = sk.sk_to_pk();
    (PublicKey(pk), PrivateKey(sk))
}
