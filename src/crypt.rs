//! OCB2-AES128 authenticated encryption, Mumble's legacy UDP crypto layer.
//!
//! This is the client-side mirror of Zumble's server-side `CryptState`:
//! same key/IV bookkeeping, same 256-entry replay window, same late/lost
//! classification of out-of-order packets. The only difference from a
//! server's crypt state is which IV plays which role — here `encryptIv`
//! starts from the *client* nonce we generate and `decryptIv` starts from
//! the *server* nonce we're handed in `CryptSetup`.
//!
//! OCB2 (Rogaway et al.) is a single-pass AEAD block cipher mode. Mumble's
//! dialect folds in an XEX*-attack guard that rejects/perturbs certain
//! pathological final-block plaintexts; see `xexstar_prefix_all_zero` below,
//! invoked from both `ocb_encrypt` and `ocb_decrypt`.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::voice::{VoiceCodecError, VoicePacket, VoicePacketDst};

const BLOCK_SIZE: usize = 16;
const AES_KEY_SIZE: usize = 16;
const HEADER_SIZE: usize = 4;

type Block = [u8; BLOCK_SIZE];

fn zero_block() -> Block {
    [0u8; BLOCK_SIZE]
}

fn xor_block(a: &Block, b: &Block) -> Block {
    let mut out = zero_block();
    for i in 0..BLOCK_SIZE {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// GF(2^128) doubling under Mumble/OCB2's big-endian bit convention: shift
/// the whole block left by one bit; if the (shifted-out) MSB was set, XOR
/// the irreducible-polynomial constant `0x87` into the last byte.
fn s2(block: &Block) -> Block {
    let mut out = zero_block();
    let msb_set = block[0] & 0x80 != 0;
    let mut carry = 0u8;
    for i in (0..BLOCK_SIZE).rev() {
        let new_carry = (block[i] & 0x80) >> 7;
        out[i] = (block[i] << 1) | carry;
        carry = new_carry;
    }
    if msb_set {
        out[BLOCK_SIZE - 1] ^= 0x87;
    }
    out
}

fn s3(block: &Block) -> Block {
    xor_block(block, &s2(block))
}

fn aes_encrypt_block(cipher: &Aes128, block: &Block) -> Block {
    let mut ga = aes::Block::clone_from_slice(block);
    cipher.encrypt_block(&mut ga);
    let mut out = zero_block();
    out.copy_from_slice(ga.as_slice());
    out
}

fn aes_decrypt_block(cipher: &Aes128, block: &Block) -> Block {
    let mut ga = aes::Block::clone_from_slice(block);
    cipher.decrypt_block(&mut ga);
    let mut out = zero_block();
    out.copy_from_slice(ga.as_slice());
    out
}

/// Detects the "all but the last byte of the final OCB2 pad are zero"
/// condition the reference implementation guards against: encrypting such
/// a block leaks whether the plaintext/pad prefix was all-zero, which is
/// the XEX* distinguishing attack. On encrypt we flip a bit in the offending
/// byte of the plaintext copy (the "modify plain" strategy); on decrypt we
/// simply reject, since a legitimate sender never produces this pattern.
fn xexstar_prefix_all_zero(pad: &Block, len: usize) -> bool {
    if len == 0 || len >= BLOCK_SIZE {
        return false;
    }
    pad[..len - 1].iter().all(|&b| b == 0)
}

#[derive(Default, Clone, Copy, Debug)]
pub struct CryptStats {
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
}

/// Owned by the UDP voice client for the lifetime of one session.
pub struct CryptState {
    raw_key: [u8; AES_KEY_SIZE],
    encrypt_iv: Block,
    decrypt_iv: Block,
    decrypt_history: [u8; 256],
    init: bool,

    encrypt_cipher: Option<Aes128>,
    decrypt_cipher: Option<Aes128>,

    pub stats_local: CryptStats,
    pub stats_remote: CryptStats,
}

impl Default for CryptState {
    fn default() -> Self {
        CryptState {
            raw_key: [0u8; AES_KEY_SIZE],
            encrypt_iv: zero_block(),
            decrypt_iv: zero_block(),
            decrypt_history: [0u8; 256],
            init: false,
            encrypt_cipher: None,
            decrypt_cipher: None,
            stats_local: CryptStats::default(),
            stats_remote: CryptStats::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptOutcome {
    Ok,
    Late,
    Lost(u32),
}

impl CryptState {
    pub fn is_valid(&self) -> bool {
        self.init
    }

    /// `setKey` — full triple from a `CryptSetup{key, client_nonce, server_nonce}`.
    pub fn set_key(&mut self, key: &[u8], client_nonce: &[u8], server_nonce: &[u8]) {
        self.raw_key.copy_from_slice(&key[..AES_KEY_SIZE]);
        self.encrypt_iv.copy_from_slice(&client_nonce[..BLOCK_SIZE]);
        self.decrypt_iv.copy_from_slice(&server_nonce[..BLOCK_SIZE]);
        self.decrypt_history = [0u8; 256];
        self.encrypt_cipher = Some(Aes128::new_from_slice(&self.raw_key).expect("16-byte key"));
        self.decrypt_cipher = Some(Aes128::new_from_slice(&self.raw_key).expect("16-byte key"));
        self.init = true;
    }

    /// Server-initiated resync: replace only `decryptIv` and clear the
    /// replay window, keeping the key and `encryptIv` untouched.
    pub fn set_decrypt_iv(&mut self, iv: &[u8]) {
        self.decrypt_iv.copy_from_slice(&iv[..BLOCK_SIZE]);
        self.decrypt_history = [0u8; 256];
        self.stats_local.resync += 1;
    }

    pub fn get_encrypt_iv(&self) -> Block {
        self.encrypt_iv
    }

    pub fn reset(&mut self) {
        *self = CryptState::default();
    }

    fn increment_encrypt_iv(&mut self) {
        for byte in self.encrypt_iv.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }

    /// Encodes and encrypts one voice packet onto `dst`. Fails if the
    /// packet doesn't fit the legacy frame (e.g. an oversized Opus
    /// payload) rather than panicking — callers must reject the frame at
    /// their boundary instead of ever reaching an unkeyed or oversized
    /// encrypt.
    pub fn encrypt<Dst: VoicePacketDst>(&mut self, packet: &VoicePacket<Dst>, dst: &mut bytes::BytesMut) -> Result<(), VoiceCodecError> {
        let mut plain = bytes::BytesMut::new();
        crate::voice::encode_voice_packet(packet, &mut plain)?;

        self.increment_encrypt_iv();

        let cipher = self.encrypt_cipher.as_ref().expect("crypt state not keyed");
        let (ciphertext, tag) = ocb_encrypt(cipher, &plain, &self.encrypt_iv);

        dst.reserve(HEADER_SIZE + ciphertext.len());
        dst.extend_from_slice(&[self.encrypt_iv[0], tag[0], tag[1], tag[2]]);
        dst.extend_from_slice(&ciphertext);
        Ok(())
    }

    /// Attempts to decrypt one UDP datagram. Returns the decoded voice
    /// packet plus a classification of how it arrived (in-order, late,
    /// indicating loss, or rejected), or `None` on any failure — callers
    /// must silently drop rejected packets per the gateway's error taxonomy.
    pub fn decrypt<Dst: VoicePacketDst>(
        &mut self,
        packet: &[u8],
    ) -> Option<(VoicePacket<Dst>, DecryptOutcome)> {
        if packet.len() < HEADER_SIZE + 1 {
            crate::metrics::VOICE_DECRYPT_FAILURES_TOTAL.with_label_values(&["eof"]).inc();
            return None;
        }

        let byte0 = packet[0];
        let saved_iv = self.decrypt_iv;

        let (new_iv, outcome) = match self.classify_iv(byte0) {
            Some(v) => v,
            None => {
                crate::metrics::VOICE_DECRYPT_FAILURES_TOTAL.with_label_values(&["stale"]).inc();
                return None;
            }
        };

        if self.decrypt_history[new_iv[0] as usize] == new_iv[1] {
            crate::metrics::VOICE_DECRYPT_FAILURES_TOTAL.with_label_values(&["replay"]).inc();
            return None;
        }

        let Some(cipher) = self.decrypt_cipher.as_ref() else {
            crate::metrics::VOICE_DECRYPT_FAILURES_TOTAL.with_label_values(&["not_keyed"]).inc();
            return None;
        };
        let ciphertext = &packet[HEADER_SIZE..];
        let (plain, tag, xexstar_rejected) = ocb_decrypt(cipher, ciphertext, &new_iv);

        if xexstar_rejected {
            // A legitimate sender's "modify plain" encrypt path never produces
            // this pattern; reject outright rather than risk the XEX* leak.
            crate::metrics::VOICE_DECRYPT_FAILURES_TOTAL.with_label_values(&["xexstar"]).inc();
            return None;
        }

        if tag[0] != packet[1] || tag[1] != packet[2] || tag[2] != packet[3] {
            self.decrypt_iv = saved_iv;
            crate::metrics::VOICE_DECRYPT_FAILURES_TOTAL.with_label_values(&["auth"]).inc();
            return None;
        }

        self.decrypt_iv = new_iv;
        self.decrypt_history[new_iv[0] as usize] = new_iv[1];

        match outcome {
            DecryptOutcome::Ok => self.stats_local.good = self.stats_local.good.saturating_add(1),
            DecryptOutcome::Late => self.stats_local.late = self.stats_local.late.saturating_add(1),
            DecryptOutcome::Lost(n) => self.stats_local.lost = self.stats_local.lost.saturating_add(n),
        }

        let Ok(decoded) = crate::voice::decode_voice_packet::<Dst>(&plain) else {
            crate::metrics::VOICE_DECRYPT_FAILURES_TOTAL.with_label_values(&["decode"]).inc();
            return None;
        };
        Some((decoded, outcome))
    }

    /// Implements the byte0-comparison state machine from the spec: works
    /// out whether this datagram is in-order, a late arrival within the
    /// 30-packet window, or evidence of `delta-1` lost packets, handling
    /// the low-byte wraparound in both directions.
    fn classify_iv(&self, byte0: u8) -> Option<(Block, DecryptOutcome)> {
        let current = self.decrypt_iv[0];

        if byte0 == current.wrapping_add(1) {
            let mut iv = self.decrypt_iv;
            ripple_increment_low_byte(&mut iv);
            return Some((iv, DecryptOutcome::Ok));
        }

        // Late: byte0 is within the last 30 sequence numbers (mod 256),
        // i.e. byte0 in (current - 30, current], excluding current+1
        // already handled above.
        let diff_back = current.wrapping_sub(byte0);
        if byte0 != current && (diff_back as i32) > 0 && (diff_back as i32) < 30 {
            let mut iv = self.decrypt_iv;
            iv[0] = byte0;
            return Some((iv, DecryptOutcome::Late));
        }

        // Ahead: byte0 is further forward than +1, i.e. loss of `delta-1`
        // packets. Handles the byte-0 wraparound by ripple-incrementing
        // byte 1+ the same number of times the low byte would wrap.
        let diff_fwd = byte0.wrapping_sub(current);
        if (diff_fwd as i32) > 1 && (diff_fwd as i32) < 128 {
            let mut iv = self.decrypt_iv;
            let wraps = if byte0 > current { 0u32 } else { 1u32 };
            for _ in 0..wraps {
                ripple_increment_from(&mut iv, 1);
            }
            iv[0] = byte0;
            let lost = u32::from(diff_fwd) - 1;
            return Some((iv, DecryptOutcome::Lost(lost)));
        }

        None
    }
}

fn ripple_increment_low_byte(iv: &mut Block) {
    iv[0] = iv[0].wrapping_add(1);
    if iv[0] == 0 {
        ripple_increment_from(iv, 1);
    }
}

fn ripple_increment_from(iv: &mut Block, start: usize) {
    for byte in iv.iter_mut().skip(start) {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// OCB2 encrypt: returns `(ciphertext, tag)` with `ciphertext.len() ==
/// plain.len()`. `nonce` is the full 16-byte IV (already incremented by
/// the caller for the encrypt direction).
fn ocb_encrypt(cipher: &Aes128, plain: &[u8], nonce: &Block) -> (Vec<u8>, Block) {
    let mut delta = aes_encrypt_block(cipher, nonce);
    let mut checksum = zero_block();
    let mut out = Vec::with_capacity(plain.len());

    let mut remaining = plain;
    while remaining.len() > BLOCK_SIZE {
        delta = s2(&delta);
        let mut block = zero_block();
        block.copy_from_slice(&remaining[..BLOCK_SIZE]);

        let tmp = xor_block(&delta, &block);
        let enc = aes_encrypt_block(cipher, &tmp);
        let cipher_block = xor_block(&delta, &enc);
        out.extend_from_slice(&cipher_block);

        checksum = xor_block(&checksum, &block);
        remaining = &remaining[BLOCK_SIZE..];
    }

    delta = s2(&delta);
    let len = remaining.len();
    let mut len_block = zero_block();
    len_block[BLOCK_SIZE - 2..].copy_from_slice(&((len as u16) * 8).to_be_bytes());
    let pad_input = xor_block(&len_block, &delta);
    let pad = aes_encrypt_block(cipher, &pad_input);

    let mut final_plain = zero_block();
    final_plain[..len].copy_from_slice(remaining);
    final_plain[len..].copy_from_slice(&pad[len..]);

    if xexstar_prefix_all_zero(&pad, len) {
        // "modify plain" mode: flip the low bit of the first plaintext byte
        // so the leaked prefix is never all-zero.
        final_plain[0] ^= 0x01;
    }

    checksum = xor_block(&checksum, &final_plain);

    let cipher_final = xor_block(&pad, &final_plain);
    out.extend_from_slice(&cipher_final[..len]);

    delta = s3(&delta);
    let tag_input = xor_block(&delta, &checksum);
    let tag = aes_encrypt_block(cipher, &tag_input);

    (out, tag)
}

/// OCB2 decrypt: inverse of [`ocb_encrypt`]. Returns `(plaintext, tag,
/// xexstar_rejected)`; the caller is responsible for comparing `tag`
/// against the packet's authentication bytes — this function does not
/// reject on a tag mismatch. `xexstar_rejected` mirrors the encrypt-side
/// guard: true when the final block's pad has the all-but-last-byte-zero
/// pattern a legitimate "modify plain" sender would have avoided.
fn ocb_decrypt(cipher: &Aes128, ciphertext: &[u8], nonce: &Block) -> (Vec<u8>, Block, bool) {
    let mut delta = aes_encrypt_block(cipher, nonce);
    let mut checksum = zero_block();
    let mut out = Vec::with_capacity(ciphertext.len());

    let mut remaining = ciphertext;
    while remaining.len() > BLOCK_SIZE {
        delta = s2(&delta);
        let mut block = zero_block();
        block.copy_from_slice(&remaining[..BLOCK_SIZE]);

        let tmp = xor_block(&delta, &block);
        let dec = aes_decrypt_block(cipher, &tmp);
        let plain_block = xor_block(&delta, &dec);
        out.extend_from_slice(&plain_block);

        checksum = xor_block(&checksum, &plain_block);
        remaining = &remaining[BLOCK_SIZE..];
    }

    delta = s2(&delta);
    let len = remaining.len();
    let mut len_block = zero_block();
    len_block[BLOCK_SIZE - 2..].copy_from_slice(&((len as u16) * 8).to_be_bytes());
    let pad_input = xor_block(&len_block, &delta);
    let pad = aes_encrypt_block(cipher, &pad_input);
    let xexstar_rejected = xexstar_prefix_all_zero(&pad, len);

    let mut final_plain = zero_block();
    for i in 0..len {
        final_plain[i] = remaining[i] ^ pad[i];
    }
    final_plain[len..].copy_from_slice(&pad[len..]);

    checksum = xor_block(&checksum, &final_plain);

    out.extend_from_slice(&final_plain[..len]);

    delta = s3(&delta);
    let tag_input = xor_block(&delta, &checksum);
    let tag = aes_encrypt_block(cipher, &tag_input);

    (out, tag, xexstar_rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::{Clientbound, Serverbound};
    use std::marker::PhantomData;

    fn keyed_pair() -> (CryptState, CryptState) {
        let key = [0x11u8; 16];
        let client_nonce = [0x22u8; 16];
        let server_nonce = [0x33u8; 16];

        let mut client = CryptState::default();
        // Client encrypts with its own nonce, decrypts with the server's.
        client.set_key(&key, &client_nonce, &server_nonce);

        let mut server = CryptState::default();
        // Mirror image: server encrypts with what it calls its nonce
        // (== client's decrypt_iv) and decrypts with client_nonce.
        server.set_key(&key, &server_nonce, &client_nonce);

        (client, server)
    }

    fn sample_packet() -> VoicePacket<Serverbound> {
        VoicePacket::Audio {
            _dst: PhantomData,
            target: 0,
            session_id: (),
            sequence: 7,
            opus: bytes::Bytes::copy_from_slice(&[0xab; 40]),
            is_last_frame: false,
        }
    }

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let (mut client, mut server) = keyed_pair();
        let packet = sample_packet();

        let mut wire = bytes::BytesMut::new();
        client.encrypt(&packet, &mut wire).unwrap();

        let (decoded, outcome): (VoicePacket<Serverbound>, _) =
            server.decrypt(&wire).expect("decrypt should succeed");
        assert_eq!(outcome, DecryptOutcome::Ok);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn bit_flip_in_ciphertext_is_rejected() {
        let (mut client, mut server) = keyed_pair();
        let packet = sample_packet();

        let mut wire = bytes::BytesMut::new();
        client.encrypt(&packet, &mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let result: Option<(VoicePacket<Serverbound>, _)> = server.decrypt(&wire);
        assert!(result.is_none());
    }

    #[test]
    fn bit_flip_in_tag_is_rejected() {
        let (mut client, mut server) = keyed_pair();
        let packet = sample_packet();

        let mut wire = bytes::BytesMut::new();
        client.encrypt(&packet, &mut wire).unwrap();
        wire[1] ^= 0x01;

        let result: Option<(VoicePacket<Serverbound>, _)> = server.decrypt(&wire);
        assert!(result.is_none());
    }

    #[test]
    fn replay_is_rejected() {
        let (mut client, mut server) = keyed_pair();
        let packet = sample_packet();

        let mut wire = bytes::BytesMut::new();
        client.encrypt(&packet, &mut wire).unwrap();

        let first: Option<(VoicePacket<Serverbound>, _)> = server.decrypt(&wire);
        assert!(first.is_some());

        let replay: Option<(VoicePacket<Serverbound>, _)> = server.decrypt(&wire);
        assert!(replay.is_none(), "replayed packet must be rejected");
    }

    #[test]
    fn out_of_order_within_window_is_late() {
        let (mut client, mut server) = keyed_pair();

        let mut wires = Vec::new();
        for i in 0..3u64 {
            let packet = VoicePacket::<Serverbound>::Audio {
                _dst: PhantomData,
                target: 0,
                session_id: (),
                sequence: i,
                opus: bytes::Bytes::copy_from_slice(&[i as u8; 8]),
                is_last_frame: false,
            };
            let mut wire = bytes::BytesMut::new();
            client.encrypt(&packet, &mut wire).unwrap();
            wires.push(wire);
        }

        // Deliver packet 1 then packet 0: packet 0 should be classified late.
        let (_, outcome1): (VoicePacket<Serverbound>, _) = server.decrypt(&wires[1]).unwrap();
        assert_eq!(outcome1, DecryptOutcome::Ok);

        let (_, outcome0): (VoicePacket<Serverbound>, _) = server.decrypt(&wires[0]).unwrap();
        assert_eq!(outcome0, DecryptOutcome::Late);
    }

    #[test]
    fn gap_is_classified_as_lost() {
        let (mut client, mut server) = keyed_pair();

        let mut wires = Vec::new();
        for i in 0..3u64 {
            let packet = VoicePacket::<Serverbound>::Audio {
                _dst: PhantomData,
                target: 0,
                session_id: (),
                sequence: i,
                opus: bytes::Bytes::copy_from_slice(&[i as u8; 8]),
                is_last_frame: false,
            };
            let mut wire = bytes::BytesMut::new();
            client.encrypt(&packet, &mut wire).unwrap();
            wires.push(wire);
        }

        // Skip packet 1, deliver packet 2 directly: one packet lost.
        let (_, outcome): (VoicePacket<Serverbound>, _) = server.decrypt(&wires[2]).unwrap();
        assert_eq!(outcome, DecryptOutcome::Lost(1));
    }

    #[test]
    fn low_byte_wraparound_increments_next_byte() {
        let mut iv = [0u8; 16];
        iv[0] = 0xff;
        ripple_increment_low_byte(&mut iv);
        assert_eq!(iv[0], 0x00);
        assert_eq!(iv[1], 0x01);
    }

    #[test]
    fn s2_then_s3_are_distinct_from_identity() {
        let block = [0x01u8; 16];
        let doubled = s2(&block);
        assert_ne!(doubled, block);
        let tripled = s3(&block);
        assert_eq!(tripled, xor_block(&block, &doubled));
    }

    #[test]
    fn xexstar_guard_flags_all_zero_prefix_pads() {
        let mut pad = zero_block();
        pad[BLOCK_SIZE - 1] = 0x42;
        assert!(xexstar_prefix_all_zero(&pad, 8));

        let mut pad = zero_block();
        pad[3] = 0x01;
        assert!(!xexstar_prefix_all_zero(&pad, 8));

        // Full-block and empty final blocks never hit the guard.
        assert!(!xexstar_prefix_all_zero(&zero_block(), 0));
        assert!(!xexstar_prefix_all_zero(&zero_block(), BLOCK_SIZE));
    }

    #[test]
    fn ocb_decrypt_reports_no_guard_trip_for_a_real_round_trip() {
        let (mut client, mut server) = keyed_pair();
        let packet = sample_packet();

        let mut wire = bytes::BytesMut::new();
        client.encrypt(&packet, &mut wire).unwrap();

        // Reach directly past CryptState::decrypt's bookkeeping to confirm
        // ocb_decrypt's own guard flag on a real, honestly-encrypted packet.
        let cipher = server.decrypt_cipher.as_ref().unwrap();
        let ciphertext = &wire[HEADER_SIZE..];
        let (_, _, rejected) = ocb_decrypt(cipher, ciphertext, &server.decrypt_iv);
        assert!(!rejected, "a freshly encrypted packet must never trip its own guard");
    }
}
