use zeroize::{Zeroize, ZeroizeOnDrop};

/// A byte buffer that is cleared when dropped, mirroring the teacher's
/// `Secret<T>` (`warpgate-common/src/types/secret.rs`) but specialized to
/// bytes so credential material can be wiped with `zeroize` rather than
/// merely hidden from `Debug`.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn expose_secret(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<secret>")
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

impl From<String> for SecretBytes {
    fn from(v: String) -> Self {
        Self::new(v.into_bytes())
    }
}

/// The credential tagged union (§3). Variants carrying secret material zero
/// it on drop.
#[derive(Clone, Debug)]
pub enum Credential {
    Password(SecretBytes),
    PrivateKeyPem(SecretBytes),
    AgentProxy,
    GssapiToken(SecretBytes),
    /// Ask the peer over the auth FD for each prompt.
    Bridge,
    None,
}

impl Credential {
    /// Parses the legacy `"user:password"` basic-credential format (§4.E):
    /// the user is the prefix up to the first `:`, the password is the
    /// (possibly empty) remainder.
    pub fn parse_basic(user_password: &str) -> (String, Credential) {
        match user_password.split_once(':') {
            Some((user, password)) => {
                (user.to_owned(), Credential::Password(password.to_owned().into()))
            }
            None => (user_password.to_owned(), Credential::Password(String::new().into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_credential_splits_on_first_colon() {
        let (user, cred) = Credential::parse_basic("admin:pa:ss");
        assert_eq!(user, "admin");
        match cred {
            Credential::Password(p) => assert_eq!(p.expose_secret(), b"pa:ss"),
            _ => panic!("expected password credential"),
        }
    }

    #[test]
    fn basic_credential_allows_empty_password() {
        let (user, cred) = Credential::parse_basic("admin:");
        assert_eq!(user, "admin");
        match cred {
            Credential::Password(p) => assert_eq!(p.expose_secret(), b""),
            _ => panic!("expected password credential"),
        }
    }
}
