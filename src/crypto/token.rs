//! Authentication tokens.
//!
//! A token is 32 bytes of TLS keying material exported from the connection
//! with the client id as label and the password as context. Both peers
//! derive it independently, so the password never crosses the wire and a
//! token is useless on any other connection.

use std::fmt;
use std::io;

use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::QuicConnection;
use crate::core::constants::TOKEN_SIZE;

/// A connection-bound authentication token. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AuthToken([u8; TOKEN_SIZE]);

impl AuthToken {
    /// Derive the token for `client_id` and `password` on `conn`.
    pub fn derive<C: QuicConnection + ?Sized>(
        conn: &C,
        client_id: &Uuid,
        password: &[u8],
    ) -> io::Result<Self> {
        let mut token = [0u8; TOKEN_SIZE];
        conn.export_keying_material(&mut token, client_id.as_bytes(), password)?;
        Ok(Self(token))
    }

    /// Wrap raw token bytes as received on the wire.
    pub fn from_bytes(bytes: [u8; TOKEN_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }

    /// Constant-time comparison.
    pub fn verify(&self, presented: &[u8; TOKEN_SIZE]) -> bool {
        self.0
            .iter()
            .zip(presented.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(..)")
    }
}
