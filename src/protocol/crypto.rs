//! Tor Protocol Cryptography
//!
//! Implements the relay-cell crypto used on a circuit:
//! - AES-128-CTR for stream encryption
//! - SHA-1 for running digests (required by tor-spec.txt)
//! - KDF-TOR for CREATE_FAST key derivation
//! - Onion encryption (layered encryption through multiple hops)
//!
//! Cipher and digest state are cursors: every relay cell advances them and
//! they are never rewound. `OnionCrypto` only hands them out behind `&mut`,
//! so each cell is applied exactly once and in order.
//!
//! Security: All key material is zeroized on drop to prevent memory leakage.

use std::fmt;

use aes::Aes128;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use rand::{CryptoRng, RngCore};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::cell::{ChanMsg, RelayBody, FAST_KEY_LEN};
use super::relay::{RelayCell, DIGEST_RANGE};
use crate::error::{Result, TorError};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// SHA-1 output size
pub const DIGEST_LEN: usize = 20;

/// AES-128 key size
pub const CIPHER_KEY_LEN: usize = 16;

/// KDF-TOR output consumed by CREATE_FAST: KH | Df | Db | Kf | Kb
const FAST_KDF_LEN: usize = DIGEST_LEN * 3 + CIPHER_KEY_LEN * 2;

/// KDF-TOR: `SHA1(K0 | [0]) | SHA1(K0 | [1]) | ...` truncated to `n_bytes`.
pub fn kdf_tor(seed: &[u8], n_bytes: usize) -> Result<Zeroizing<Vec<u8>>> {
    if n_bytes > DIGEST_LEN * 256 {
        return Err(TorError::Crypto(format!(
            "KDF-TOR cannot produce {} bytes",
            n_bytes
        )));
    }

    let mut result = Zeroizing::new(Vec::with_capacity(n_bytes + DIGEST_LEN));
    let mut k = 0usize;
    while result.len() < n_bytes {
        let mut d = Sha1::new();
        d.update(seed);
        d.update([k as u8]);
        result.extend_from_slice(&d.finalize());
        k += 1;
    }

    result.truncate(n_bytes);
    Ok(result)
}

/// Key material for one hop
///
/// SECURITY: Keys are automatically zeroized when dropped to prevent
/// memory leakage of sensitive cryptographic material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    /// Handshake confirmation value
    pub kh: [u8; DIGEST_LEN],

    /// Forward digest seed (client → relay)
    pub forward_digest: [u8; DIGEST_LEN],

    /// Backward digest seed (relay → client)
    pub backward_digest: [u8; DIGEST_LEN],

    /// Forward encryption key (client → relay)
    pub forward_key: [u8; CIPHER_KEY_LEN],

    /// Backward encryption key (relay → client)
    pub backward_key: [u8; CIPHER_KEY_LEN],
}

impl CircuitKeys {
    /// Expand a CREATE_FAST key seed (`X | Y`) with KDF-TOR
    pub fn from_key_seed(key_seed: &[u8]) -> Result<Self> {
        let okm = kdf_tor(key_seed, FAST_KDF_LEN)?;

        let mut keys = CircuitKeys {
            kh: [0u8; DIGEST_LEN],
            forward_digest: [0u8; DIGEST_LEN],
            backward_digest: [0u8; DIGEST_LEN],
            forward_key: [0u8; CIPHER_KEY_LEN],
            backward_key: [0u8; CIPHER_KEY_LEN],
        };

        keys.kh.copy_from_slice(&okm[0..20]);
        keys.forward_digest.copy_from_slice(&okm[20..40]);
        keys.backward_digest.copy_from_slice(&okm[40..60]);
        keys.forward_key.copy_from_slice(&okm[60..76]);
        keys.backward_key.copy_from_slice(&okm[76..92]);

        Ok(keys)
    }
}

/// One direction of one hop: a stream-cipher cursor plus a running digest
pub struct CryptState {
    cipher: Aes128Ctr,
    digest: Sha1,
    last_digest: [u8; DIGEST_LEN],
}

impl CryptState {
    /// Start a cursor at keystream position zero (IV is all-zero in Tor)
    pub fn new(key: &[u8; CIPHER_KEY_LEN], digest_seed: &[u8; DIGEST_LEN]) -> Self {
        let iv = [0u8; 16];
        let mut digest = Sha1::new();
        digest.update(digest_seed);
        Self {
            cipher: Aes128Ctr::new(key.into(), (&iv).into()),
            digest,
            last_digest: [0u8; DIGEST_LEN],
        }
    }

    /// Encrypt or decrypt in place, advancing the keystream
    pub fn apply_keystream(&mut self, body: &mut [u8]) {
        self.cipher.apply_keystream(body);
    }

    /// Fold `data` into the running digest and return the new value
    pub fn update_digest(&mut self, data: &[u8]) -> [u8; DIGEST_LEN] {
        self.digest.update(data);
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&self.digest.clone().finalize());
        self.last_digest = out;
        out
    }

    /// Most recent running-digest value
    pub fn last_digest(&self) -> [u8; DIGEST_LEN] {
        self.last_digest
    }
}

impl fmt::Debug for CryptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptState").finish_non_exhaustive()
    }
}

/// Live crypto state for one hop, both directions
pub struct HopKeys {
    forward: CryptState,
    backward: CryptState,
    kh: Zeroizing<[u8; DIGEST_LEN]>,
}

impl HopKeys {
    /// Build cursors from derived key material
    pub fn new(keys: &CircuitKeys) -> Self {
        Self {
            forward: CryptState::new(&keys.forward_key, &keys.forward_digest),
            backward: CryptState::new(&keys.backward_key, &keys.backward_digest),
            kh: Zeroizing::new(keys.kh),
        }
    }

    /// Derive hop keys from both sides' CREATE_FAST material
    pub fn kdf_tor(client_material: &[u8], server_material: &[u8]) -> Result<Self> {
        let mut seed = Zeroizing::new(Vec::with_capacity(
            client_material.len() + server_material.len(),
        ));
        seed.extend_from_slice(client_material);
        seed.extend_from_slice(server_material);

        let keys = CircuitKeys::from_key_seed(&seed)?;
        Ok(Self::new(&keys))
    }

    /// Confirmation value derived alongside the keys
    pub fn kh(&self) -> &[u8; DIGEST_LEN] {
        &self.kh
    }

    /// Check the responder's confirmation value in constant time
    pub fn verify(&self, kh: &[u8]) -> bool {
        self.kh.as_slice().ct_eq(kh).into()
    }

    /// Split into (forward, backward) cursors
    pub fn into_layers(self) -> (CryptState, CryptState) {
        (self.forward, self.backward)
    }
}

impl fmt::Debug for HopKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HopKeys").finish_non_exhaustive()
    }
}

/// Responder side of CREATE_FAST: pick server material, derive keys, and
/// build the CREATED_FAST reply.
pub fn create_fast_reply<R: RngCore + CryptoRng>(
    rng: &mut R,
    client_material: &[u8; FAST_KEY_LEN],
) -> Result<(HopKeys, ChanMsg)> {
    let mut key_material = [0u8; FAST_KEY_LEN];
    rng.fill_bytes(&mut key_material);

    let keys = HopKeys::kdf_tor(client_material, &key_material)?;
    let reply = ChanMsg::CreatedFast {
        key_material,
        kh: *keys.kh(),
    };
    Ok((keys, reply))
}

/// Onion Crypto Engine
///
/// Holds one direction's cursors for every hop of a circuit, ordered
/// guard first. The same engine type serves both directions:
/// `seal` digests with the last hop and encrypts last-to-first,
/// `open` decrypts first-to-last and checks the last hop's digest.
#[derive(Debug, Default)]
pub struct OnionCrypto {
    /// Cursors for each hop in the circuit (ordered: Guard → ... → last)
    layers: Vec<CryptState>,
}

impl OnionCrypto {
    /// Create new onion crypto with per-hop cursors
    pub fn new(layers: Vec<CryptState>) -> Self {
        Self { layers }
    }

    /// Append the cursor for a newly added hop
    pub fn push(&mut self, layer: CryptState) {
        self.layers.push(layer);
    }

    pub fn hop_count(&self) -> usize {
        self.layers.len()
    }

    /// Last digest computed by the last hop's cursor
    pub fn last_digest(&self) -> Option<[u8; DIGEST_LEN]> {
        self.layers.last().map(CryptState::last_digest)
    }

    /// Outbound path: encode, stamp the running digest, wrap every layer.
    pub fn seal(&mut self, cell: &RelayCell) -> Result<RelayBody> {
        let mut body = cell.encode()?;

        let last = self
            .layers
            .last_mut()
            .ok_or_else(|| TorError::InvalidState("no hops to encrypt for".into()))?;
        let digest = last.update_digest(&body);
        body[DIGEST_RANGE].copy_from_slice(&digest[..4]);

        log::trace!(
            "sealing relay cmd {} stream {} digest {}",
            cell.command_byte(),
            cell.stream_id,
            hex::encode(&digest[..4])
        );

        // Encrypt in reverse order: last hop first, guard last
        for layer in self.layers.iter_mut().rev() {
            layer.apply_keystream(&mut body);
        }

        Ok(body)
    }

    /// Inbound path: peel every layer, verify the last hop's digest, decode.
    pub fn open(&mut self, mut body: RelayBody) -> Result<RelayCell> {
        if self.layers.is_empty() {
            return Err(TorError::InvalidState("no hops to decrypt for".into()));
        }

        // Decrypt in forward order: guard first
        for layer in self.layers.iter_mut() {
            layer.apply_keystream(&mut body);
        }

        let mut received = [0u8; 4];
        received.copy_from_slice(&body[DIGEST_RANGE]);
        body[DIGEST_RANGE].fill(0);

        let last = self
            .layers
            .last_mut()
            .ok_or_else(|| TorError::InvalidState("no hops to decrypt for".into()))?;
        let digest = last.update_digest(&body);

        if !bool::from(digest[..4].ct_eq(&received)) {
            log::warn!(
                "relay digest mismatch: expected {}, got {}",
                hex::encode(&digest[..4]),
                hex::encode(received)
            );
            return Err(TorError::DigestMismatch);
        }

        RelayCell::decode(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay::RelayMsg;

    fn hops(n: u8) -> Vec<CircuitKeys> {
        (0..n)
            .map(|i| CircuitKeys::from_key_seed(&[i; 40]).unwrap())
            .collect()
    }

    /// Client engine and the matching relay-side engine for one direction
    fn forward_pair(keys: &[CircuitKeys]) -> (OnionCrypto, OnionCrypto) {
        let client = keys.iter().map(|k| HopKeys::new(k).into_layers().0).collect();
        let relays = keys.iter().map(|k| HopKeys::new(k).into_layers().0).collect();
        (OnionCrypto::new(client), OnionCrypto::new(relays))
    }

    fn backward_pair(keys: &[CircuitKeys]) -> (OnionCrypto, OnionCrypto) {
        let relays = keys.iter().map(|k| HopKeys::new(k).into_layers().1).collect();
        let client = keys.iter().map(|k| HopKeys::new(k).into_layers().1).collect();
        (OnionCrypto::new(relays), OnionCrypto::new(client))
    }

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_kdf_tor_create_fast_vector() {
        // CREATE_FAST exchange generated from Tor
        let x = unhex("080E247DF7C252FCD2DC10F459703480C223E3A6");
        let y = unhex("BA95C0D092335428BF80093BBED0B7A26C49E1E8");
        let kh = unhex("696FBF9C8D6BE26504219C000D26AFE370FCEF04");
        let keys = unhex(
            "AFA89B4FC8CF882335A582C52478B5FCB1E08DAF707E2C2D23B8C27D30BD461F3DF98A3AF82221CB\
             658AD0AA8680B99067E4F7DBC546970EA9A56B26433C71DA867BDD09C14A1308BC327D6A448D71D2\
             382B3AB6AF0BB4E19649A8DFF607DB9C57A04AC3",
        );

        let mut seed = x.clone();
        seed.extend_from_slice(&y);
        let okm = kdf_tor(&seed, 120).unwrap();
        assert_eq!(&okm[..20], &kh[..]);
        assert_eq!(&okm[20..], &keys[..]);

        let derived = CircuitKeys::from_key_seed(&seed).unwrap();
        assert_eq!(&derived.kh[..], &kh[..]);
        assert_eq!(&derived.forward_digest[..], &keys[0..20]);
        assert_eq!(&derived.backward_digest[..], &keys[20..40]);
        assert_eq!(&derived.forward_key[..], &keys[40..56]);
        assert_eq!(&derived.backward_key[..], &keys[56..72]);

        let hop = HopKeys::kdf_tor(&x, &y).unwrap();
        assert!(hop.verify(&kh));
        let mut bad = kh.clone();
        bad[19] ^= 1;
        assert!(!hop.verify(&bad));
    }

    #[test]
    fn test_kdf_tor_length_limit() {
        assert!(kdf_tor(b"seed", 20 * 256).is_ok());
        assert!(kdf_tor(b"seed", 20 * 256 + 1).is_err());
    }

    #[test]
    fn test_circuit_keys_zeroize() {
        let mut keys = CircuitKeys::from_key_seed(&[7; 40]).unwrap();
        keys.zeroize();
        assert_eq!(keys.kh, [0u8; 20]);
        assert_eq!(keys.forward_key, [0u8; 16]);
        assert_eq!(keys.backward_key, [0u8; 16]);
        assert_eq!(keys.forward_digest, [0u8; 20]);
        assert_eq!(keys.backward_digest, [0u8; 20]);
    }

    #[test]
    fn test_create_fast_reply_matches_client() {
        let mut rng = rand::thread_rng();
        let x = [0x11; FAST_KEY_LEN];
        let (_, reply) = create_fast_reply(&mut rng, &x).unwrap();
        let ChanMsg::CreatedFast { key_material, kh } = reply else {
            panic!("expected CREATED_FAST");
        };
        let client = HopKeys::kdf_tor(&x, &key_material).unwrap();
        assert!(client.verify(&kh));
    }

    #[test]
    fn test_aes_ctr_cursor_is_stateful() {
        let key = [42u8; 16];
        let mut a = CryptState::new(&key, &[0; 20]);
        let mut b = CryptState::new(&key, &[0; 20]);

        let mut one = *b"Hello, Tor!";
        let mut two = *b"Hello, Tor!";
        a.apply_keystream(&mut one);
        a.apply_keystream(&mut two);
        // Same plaintext, different keystream position
        assert_ne!(one, two);

        b.apply_keystream(&mut one);
        b.apply_keystream(&mut two);
        assert_eq!(&one, b"Hello, Tor!");
        assert_eq!(&two, b"Hello, Tor!");
    }

    #[test]
    fn test_onion_layering_three_hops() {
        let keys = hops(3);
        let (mut client, mut relays) = forward_pair(&keys);

        let cell = RelayCell::new(7, RelayMsg::Data(b"Test data through 3 hops".to_vec()));
        let sealed = client.seal(&cell).unwrap();
        assert_ne!(sealed, cell.encode().unwrap());

        let opened = relays.open(sealed).unwrap();
        assert_eq!(opened, cell);
    }

    #[test]
    fn test_onion_layering_order_matters() {
        let keys = hops(3);
        let (mut client, _) = forward_pair(&keys);
        let sealed = client
            .seal(&RelayCell::new(7, RelayMsg::Data(b"order".to_vec())))
            .unwrap();

        // Peel in the wrong order: last hop first
        let mut reversed_keys = hops(3);
        reversed_keys.reverse();
        let (_, mut wrong) = forward_pair(&reversed_keys);
        assert_eq!(wrong.open(sealed), Err(TorError::DigestMismatch));
    }

    #[test]
    fn test_onion_layering_wrong_encrypt_order() {
        // Wrap with the hops reversed: the client treats the guard as the exit
        let mut reversed_keys = hops(3);
        reversed_keys.reverse();
        let (mut wrong, _) = forward_pair(&reversed_keys);
        let sealed = wrong
            .seal(&RelayCell::new(7, RelayMsg::Data(b"order".to_vec())))
            .unwrap();

        let keys = hops(3);
        let (_, mut relays) = forward_pair(&keys);
        assert_eq!(relays.open(sealed), Err(TorError::DigestMismatch));
    }

    #[test]
    fn test_backward_direction_roundtrip() {
        let keys = hops(2);
        let (mut exit_side, mut client) = backward_pair(&keys);

        for i in 0..5u8 {
            let cell = RelayCell::new(3, RelayMsg::Data(vec![i; 100]));
            let sealed = exit_side.seal(&cell).unwrap();
            assert_eq!(client.open(sealed).unwrap(), cell);
        }
        assert_eq!(client.last_digest(), exit_side.last_digest());
    }

    #[test]
    fn test_digest_chaining_detects_reordering() {
        let keys = hops(1);
        let (mut relay, mut client) = backward_pair(&keys);

        let first = relay
            .seal(&RelayCell::new(1, RelayMsg::Data(b"first".to_vec())))
            .unwrap();
        let second = relay
            .seal(&RelayCell::new(1, RelayMsg::Data(b"second".to_vec())))
            .unwrap();

        // Deliver out of order
        assert_eq!(client.open(second), Err(TorError::DigestMismatch));
        let _ = first;
    }

    #[test]
    fn test_digest_depends_on_history() {
        let keys = hops(1);
        let (mut a, _) = forward_pair(&keys);
        let (mut b, _) = forward_pair(&keys);

        let x = RelayCell::new(1, RelayMsg::Data(b"x".to_vec()));
        let y = RelayCell::new(1, RelayMsg::Data(b"y".to_vec()));

        a.seal(&x).unwrap();
        a.seal(&y).unwrap();
        b.seal(&y).unwrap();
        b.seal(&x).unwrap();
        assert_ne!(a.last_digest(), b.last_digest());
    }

    #[test]
    fn test_tampering_detected() {
        let keys = hops(2);
        let (mut relay, mut client) = backward_pair(&keys);
        let mut sealed = relay
            .seal(&RelayCell::new(1, RelayMsg::Connected(vec![])))
            .unwrap();
        sealed[100] ^= 0x01;
        assert_eq!(client.open(sealed), Err(TorError::DigestMismatch));
    }

    #[test]
    fn test_empty_engine() {
        let mut engine = OnionCrypto::default();
        assert!(matches!(
            engine.seal(&RelayCell::new(0, RelayMsg::Drop)),
            Err(TorError::InvalidState(_))
        ));
        assert!(matches!(
            engine.open([0u8; 509]),
            Err(TorError::InvalidState(_))
        ));
    }
}
