//! Authenticated session channel: HMAC-SHA256 handshake, signing and
//! verification with a monotonic nonce and an explicit re-ACK path for lost
//! acknowledgements.
//!
//! Ported from the node's C `auth.c`/`auth.h`: same key length, same nonce
//! layout (a little-endian `u64`), same truncated-digest tag, same
//! handshake/sign/verify/ack state machine. The role names here ("auth
//! master" signs, "auth slave" verifies) are a different axis from the mesh
//! topology's master/slave nodes: the mesh master signs every message it
//! sends to a sensor node, and a sensor node acts as auth slave towards it.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::AuthError;

pub const AUTH_KEY_LEN: usize = 16;
const NONCE_LEN: usize = 8;
const TAG_LEN: usize = 8;
/// Nonce + tag, appended to every signed message.
pub const FOOTER_LEN: usize = NONCE_LEN + TAG_LEN;

pub type AuthKey = [u8; AUTH_KEY_LEN];

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Role {
    Master,
    Slave,
}

/// HMAC-SHA256 authenticated channel state for one peer. Not itself a
/// cryptographic primitive worth trusting outside this mesh: the digest is
/// truncated to 64 bits to keep wire frames small, which is adequate for a
/// closed, low-rate sensor network and nothing stronger.
#[derive(Clone)]
pub struct AuthChannel {
    key: AuthKey,
    nonce: u64,
    role: Role,
    handshake_cplt: bool,
    handshake_pend: bool,
}

fn generate_tag(key: &AuthKey, nonce: u64, data1: &[u8], data2: &[u8]) -> [u8; TAG_LEN] {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("hmac-sha256 accepts keys of any length");
    if !data1.is_empty() {
        mac.update(data1);
    }
    if !data2.is_empty() {
        mac.update(data2);
    }
    mac.update(&nonce.to_le_bytes());
    let digest = mac.finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    tag
}

/// Appends `nonce` and the HMAC tag to `buf[..len]`, returning the new
/// total length. `buf` must have room for `len + FOOTER_LEN` bytes.
fn sign_message(
    key: &AuthKey,
    nonce: u64,
    buf: &mut [u8],
    len: usize,
    add_data: &[u8],
) -> Result<usize, AuthError> {
    if buf.len() < len + FOOTER_LEN {
        return Err(AuthError::BufferTooSmall);
    }
    let tag = generate_tag(key, nonce, &buf[..len], add_data);
    buf[len..len + NONCE_LEN].copy_from_slice(&nonce.to_le_bytes());
    buf[len + NONCE_LEN..len + FOOTER_LEN].copy_from_slice(&tag);
    Ok(len + FOOTER_LEN)
}

/// Validates the footer of `data[..len]` against `nonce`, returning the
/// length of the data with the footer stripped. Checks the nonce before the
/// tag, matching the original's cheap-rejection ordering.
fn check_message_tag(
    key: &AuthKey,
    nonce: u64,
    data: &[u8],
    len: usize,
    add_data: &[u8],
) -> Result<usize, AuthError> {
    if len < FOOTER_LEN {
        return Err(AuthError::WrongSize);
    }
    let data_len = len - FOOTER_LEN;
    let footer = &data[data_len..len];
    let footer_nonce = &footer[..NONCE_LEN];
    if footer_nonce != nonce.to_le_bytes() {
        return Err(AuthError::WrongNonce);
    }
    let tag = generate_tag(key, nonce, &data[..data_len], add_data);
    let footer_tag = &footer[NONCE_LEN..FOOTER_LEN];
    if tag.ct_eq(footer_tag).unwrap_u8() == 0 {
        return Err(AuthError::WrongMac);
    }
    Ok(data_len)
}

impl AuthChannel {
    /// Starts a channel in the signing ("auth master") role with a fresh
    /// random challenge.
    pub fn master_init(key: AuthKey, challenge: u64) -> Self {
        AuthChannel {
            key,
            nonce: challenge,
            role: Role::Master,
            handshake_cplt: false,
            handshake_pend: false,
        }
    }

    /// Starts a channel in the verifying ("auth slave") role with the last
    /// persisted nonce (or a fresh value on first boot).
    pub fn slave_init(key: AuthKey, nonce: u64) -> Self {
        AuthChannel {
            key,
            nonce,
            role: Role::Slave,
            handshake_cplt: false,
            handshake_pend: false,
        }
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_cplt
    }

    /// The current nonce, for persisting across reboots.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Writes the outgoing challenge into `buf[offset..]`, returning the
    /// total message length.
    pub fn master_make_handshake(
        &mut self,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<usize, AuthError> {
        if self.role != Role::Master {
            return Err(AuthError::WrongState);
        }
        self.handshake_pend = true;
        if buf.len() < offset + NONCE_LEN {
            return Err(AuthError::BufferTooSmall);
        }
        buf[offset..offset + NONCE_LEN].copy_from_slice(&self.nonce.to_le_bytes());
        Ok(offset + NONCE_LEN)
    }

    /// Processes the slave's handshake reply. `data[..len]` is the full
    /// received message (header included); `offset` is the header length.
    pub fn master_process_handshake(
        &mut self,
        data: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<(), AuthError> {
        if self.role != Role::Master || self.handshake_cplt || !self.handshake_pend {
            return Err(AuthError::WrongState);
        }
        if len != FOOTER_LEN + NONCE_LEN + offset {
            return Err(AuthError::WrongSize);
        }
        if data[offset..offset + NONCE_LEN] != self.nonce.to_le_bytes() {
            return Err(AuthError::WrongNonce);
        }

        let footer = &data[offset + NONCE_LEN..len];
        let footer_nonce = u64::from_le_bytes(footer[..NONCE_LEN].try_into().unwrap());
        let footer_tag = &footer[NONCE_LEN..FOOTER_LEN];

        let tag = generate_tag(&self.key, footer_nonce, &data[..offset + NONCE_LEN], &[]);
        if tag.ct_eq(footer_tag).unwrap_u8() == 0 {
            return Err(AuthError::WrongMac);
        }

        self.nonce = footer_nonce;
        self.handshake_cplt = true;
        self.handshake_pend = false;
        self.nonce = self.nonce.wrapping_add(2);
        Ok(())
    }

    /// Appends a valid signature to `buf[..len]` using the current nonce.
    /// Does not advance the nonce; the matching ACK does that.
    pub fn master_sign(
        &self,
        buf: &mut [u8],
        len: usize,
        add_data: &[u8],
    ) -> Result<usize, AuthError> {
        if self.role != Role::Master || !self.handshake_cplt {
            return Err(AuthError::WrongState);
        }
        sign_message(&self.key, self.nonce, buf, len, add_data)
    }

    /// Verifies a bare-footer ACK message and advances the nonce by 2.
    pub fn master_check_ack(
        &mut self,
        data: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<(), AuthError> {
        if self.role != Role::Master || !self.handshake_cplt {
            return Err(AuthError::WrongState);
        }
        if len != FOOTER_LEN + offset {
            return Err(AuthError::WrongSize);
        }
        let ack_expected = self.nonce.wrapping_add(1);
        check_message_tag(&self.key, ack_expected, data, len, &[])?;
        self.nonce = self.nonce.wrapping_add(2);
        Ok(())
    }

    /// Builds the handshake reply: echoes the master's challenge and signs
    /// it with this channel's own nonce.
    pub fn slave_handshake(
        &mut self,
        inmsg: &[u8],
        inofs: usize,
        inlen: usize,
        outmsg: &mut [u8],
        outofs: usize,
    ) -> Result<usize, AuthError> {
        if self.role == Role::Master {
            return Err(AuthError::WrongState);
        }
        if outmsg.len() < FOOTER_LEN + NONCE_LEN + outofs {
            return Err(AuthError::BufferTooSmall);
        }
        if inlen != NONCE_LEN + inofs {
            return Err(AuthError::WrongSize);
        }

        outmsg[outofs..outofs + NONCE_LEN].copy_from_slice(&inmsg[inofs..inofs + NONCE_LEN]);
        let len = sign_message(&self.key, self.nonce, outmsg, outofs + NONCE_LEN, &[])?;
        self.handshake_pend = true;
        Ok(len)
    }

    /// Verifies an incoming signed message. On `Ok`, the nonce has advanced
    /// by 2 and the returned length is the payload with the footer
    /// stripped. On [`AuthError::OldNonce`], the caller should re-send the
    /// last ACK without reprocessing the message.
    pub fn slave_verify(
        &mut self,
        data: &[u8],
        len: usize,
        add_data: &[u8],
    ) -> Result<usize, AuthError> {
        if self.handshake_pend {
            self.handshake_cplt = true;
            self.handshake_pend = false;
        }
        if self.role == Role::Master || !self.handshake_cplt {
            return Err(AuthError::WrongState);
        }

        let nonce_expected = self.nonce.wrapping_add(2);
        match check_message_tag(&self.key, nonce_expected, data, len, add_data) {
            Err(AuthError::WrongNonce) => {
                let footer_nonce_bytes = &data[len - FOOTER_LEN..len - TAG_LEN];
                if footer_nonce_bytes == self.nonce.to_le_bytes() {
                    Err(AuthError::OldNonce)
                } else {
                    Err(AuthError::WrongNonce)
                }
            }
            Err(e) => Err(e),
            Ok(data_len) => {
                self.nonce = self.nonce.wrapping_add(2);
                Ok(data_len)
            }
        }
    }

    /// Builds an empty-payload ACK at `nonce + 1`, re-sent verbatim when the
    /// caller observes [`AuthError::OldNonce`].
    pub fn slave_make_ack(&self, buf: &mut [u8], offset: usize) -> Result<usize, AuthError> {
        if self.role == Role::Master || !self.handshake_cplt {
            return Err(AuthError::WrongState);
        }
        let ack_num = self.nonce.wrapping_add(1);
        sign_message(&self.key, ack_num, buf, offset, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: AuthKey = [0x42; AUTH_KEY_LEN];

    fn handshake(master: &mut AuthChannel, slave: &mut AuthChannel) {
        let mut challenge_msg = [0u8; 32];
        let clen = master.master_make_handshake(&mut challenge_msg, 0).unwrap();

        let mut reply = [0u8; 32];
        let rlen = slave
            .slave_handshake(&challenge_msg, 0, clen, &mut reply, 0)
            .unwrap();

        master.master_process_handshake(&reply, 0, rlen).unwrap();
    }

    #[test]
    fn full_handshake_then_signed_message_then_ack() {
        // (B1)
        let mut master = AuthChannel::master_init(KEY, 1000);
        let mut slave = AuthChannel::slave_init(KEY, 0);
        handshake(&mut master, &mut slave);
        assert!(master.handshake_complete());
        assert!(slave.handshake_complete());

        let mut msg = [0u8; 32];
        msg[0] = 0xAB;
        msg[1] = 0xCD;
        let len = master.master_sign(&mut msg, 2, &[]).unwrap();

        let payload_len = slave.slave_verify(&msg[..len], len, &[]).unwrap();
        assert_eq!(payload_len, 2);
        assert_eq!(&msg[..2], &[0xAB, 0xCD]);

        let mut ack = [0u8; 32];
        let ack_len = slave.slave_make_ack(&mut ack, 0).unwrap();
        master.master_check_ack(&ack, 0, ack_len).unwrap();
    }

    #[test]
    fn tampered_tag_is_rejected() {
        // (B2)
        let mut master = AuthChannel::master_init(KEY, 1000);
        let mut slave = AuthChannel::slave_init(KEY, 0);
        handshake(&mut master, &mut slave);

        let mut msg = [0u8; 32];
        let len = master.master_sign(&mut msg, 0, &[]).unwrap();
        msg[len - 1] ^= 0xFF;

        assert_eq!(slave.slave_verify(&msg[..len], len, &[]), Err(AuthError::WrongMac));
    }

    #[test]
    fn lost_ack_is_reported_as_old_nonce_not_reprocessed() {
        // (B3)
        let mut master = AuthChannel::master_init(KEY, 1000);
        let mut slave = AuthChannel::slave_init(KEY, 0);
        handshake(&mut master, &mut slave);

        let mut msg = [0u8; 32];
        let len = master.master_sign(&mut msg, 0, &[]).unwrap();
        slave.slave_verify(&msg[..len], len, &[]).unwrap();

        // Master never saw the ack and retransmits the exact same message.
        assert_eq!(
            slave.slave_verify(&msg[..len], len, &[]),
            Err(AuthError::OldNonce)
        );
    }

    #[test]
    fn wrong_state_before_handshake() {
        let master = AuthChannel::master_init(KEY, 1);
        let mut buf = [0u8; 32];
        assert_eq!(
            master.master_sign(&mut buf, 0, &[]),
            Err(AuthError::WrongState)
        );
    }

    #[test]
    fn additional_data_is_covered_by_the_tag() {
        let mut master = AuthChannel::master_init(KEY, 5);
        let mut slave = AuthChannel::slave_init(KEY, 0);
        handshake(&mut master, &mut slave);

        let mut msg = [0u8; 32];
        let len = master.master_sign(&mut msg, 0, b"header").unwrap();
        assert_eq!(
            slave.slave_verify(&msg[..len], len, b"different-header"),
            Err(AuthError::WrongMac)
        );
    }
}
