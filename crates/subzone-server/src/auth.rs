// auth.rs — login authentication pipeline
//
// A login request is checked against the password file (and, when
// configured, a billing server whose connection is managed outside the
// core; while that link is down the billing authenticator falls back to
// the password file). The digest over name+password must match the legacy
// byte layout exactly or stored hashes become unverifiable.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::Digest;
use md5::Md5;
use parking_lot::Mutex;
use sha2::{Sha256, Sha512};

use subzone_common::conf::ConfDocument;

use crate::server::MAX_NAME_LEN;

pub const MAX_PASSWORD_LEN: usize = 31;

const NAME_BUF_LEN: usize = 24;
const PASSWORD_BUF_LEN: usize = 32;

// ============================================================
// Result / request types
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCode {
    Ok,
    BadName,
    BadPassword,
    NoPermission,
    CustomText,
}

#[derive(Debug, Clone)]
pub struct AuthResult {
    pub code: AuthCode,
    pub authenticated: bool,
    /// The name echoed back to the client, as the client typed it.
    pub send_name: String,
    pub custom_text: Option<String>,
}

impl AuthResult {
    fn denied(code: AuthCode, send_name: String) -> Self {
        Self {
            code,
            authenticated: false,
            send_name,
            custom_text: None,
        }
    }

    pub fn internal_error() -> Self {
        Self {
            code: AuthCode::CustomText,
            authenticated: false,
            send_name: String::new(),
            custom_text: Some("Internal server error".to_string()),
        }
    }
}

/// Raw login payload, as pulled off the wire.
pub struct AuthRequest {
    pub name_bytes: Vec<u8>,
    pub password_bytes: Vec<u8>,
    pub client_version: u16,
}

pub trait Authenticator: Send {
    fn authenticate(&self, req: &AuthRequest) -> AuthResult;
}

// ============================================================
// Digest
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_conf(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("sha256") => HashAlgorithm::Sha256,
            Some("sha512") => HashAlgorithm::Sha512,
            _ => HashAlgorithm::Md5,
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashEncoding {
    Hex,
    Base64,
}

impl HashEncoding {
    pub fn from_conf(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("base64") => HashEncoding::Base64,
            _ => HashEncoding::Hex,
        }
    }
}

pub fn encoded_hash_len(algo: HashAlgorithm, encoding: HashEncoding) -> usize {
    let n = algo.digest_len();
    match encoding {
        HashEncoding::Hex => n * 2,
        HashEncoding::Base64 => (n + 2) / 3 * 4,
    }
}

/// Compute the stored-password digest. The input block is exactly 56
/// bytes: the lower-cased name in a 24-byte zero-filled field (truncated
/// to 23), then the password in a 32-byte zero-filled field (truncated to
/// 31, always null-terminated).
pub fn compute_password_hash(
    algo: HashAlgorithm,
    encoding: HashEncoding,
    name: &str,
    password: &str,
) -> String {
    let mut block = [0u8; NAME_BUF_LEN + PASSWORD_BUF_LEN];

    let lower = name.to_lowercase();
    let name_bytes = lower.as_bytes();
    let name_len = name_bytes.len().min(MAX_NAME_LEN);
    block[..name_len].copy_from_slice(&name_bytes[..name_len]);

    let pw_bytes = password.as_bytes();
    let pw_len = pw_bytes.len().min(MAX_PASSWORD_LEN);
    block[NAME_BUF_LEN..NAME_BUF_LEN + pw_len].copy_from_slice(&pw_bytes[..pw_len]);

    let digest: Vec<u8> = match algo {
        HashAlgorithm::Md5 => Md5::digest(block).to_vec(),
        HashAlgorithm::Sha256 => Sha256::digest(block).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(block).to_vec(),
    };

    match encoding {
        HashEncoding::Hex => hex::encode(digest),
        HashEncoding::Base64 => BASE64.encode(digest),
    }
}

/// Pull a usable name out of the fixed-width wire field: bytes up to the
/// first null, truncated to the name limit. Rejects empty names, names
/// opening with ':' (reserved on the peer wire), and non-printable bytes.
pub fn clean_name(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let trimmed: Vec<u8> = raw[..end].iter().copied().take(MAX_NAME_LEN).collect();
    if trimmed.is_empty() || trimmed[0] == b':' {
        return None;
    }
    if !trimmed.iter().all(|&b| (0x20..0x7F).contains(&b)) {
        return None;
    }
    let name = String::from_utf8_lossy(&trimmed).trim().to_string();
    if name.is_empty() || name.starts_with(':') {
        return None;
    }
    Some(name)
}

fn clean_password(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

// ============================================================
// Password-file authenticator
// ============================================================

/// Outcome of a bare password check, used by the billing fallback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwMatch {
    Match,
    Mismatch,
    NotFound,
}

pub struct PasswordFileAuth {
    pub doc: ConfDocument,
    pub algo: HashAlgorithm,
    pub encoding: HashEncoding,
    pub allow_unknown: bool,
    pub require_auth_to_set_password: bool,
    /// The digest implementation is not reentrant-safe; every hash
    /// computation funnels through this lock.
    hash_lock: Mutex<()>,
}

impl PasswordFileAuth {
    pub fn from_doc(doc: ConfDocument) -> Self {
        let algo = HashAlgorithm::from_conf(doc.get_str("General", "HashAlgorithm"));
        let encoding = HashEncoding::from_conf(doc.get_str("General", "HashEncoding"));
        let allow_unknown = doc.get_bool("General", "AllowUnknown", true);
        let require_auth = doc.get_bool("General", "RequireAuthenticationToSetPassword", true);
        Self {
            doc,
            algo,
            encoding,
            allow_unknown,
            require_auth_to_set_password: require_auth,
            hash_lock: Mutex::new(()),
        }
    }

    fn hash(&self, name: &str, password: &str) -> String {
        let _guard = self.hash_lock.lock();
        compute_password_hash(self.algo, self.encoding, name, password)
    }

    fn entry<'a>(&'a self, name: &str) -> Option<&'a str> {
        self.doc.get_str("users", &name.to_lowercase())
    }

    /// Bare check against the file; `authenticated` reports whether a match
    /// came from a real hash ("any" rows match without authenticating).
    pub fn check_password(&self, name: &str, password: &str) -> (PwMatch, bool) {
        match self.entry(name) {
            None => (PwMatch::NotFound, false),
            Some("lock") => (PwMatch::Mismatch, false),
            Some("any") => (PwMatch::Match, false),
            Some(stored) => {
                if self.hash(name, password) == stored {
                    (PwMatch::Match, true)
                } else {
                    (PwMatch::Mismatch, false)
                }
            }
        }
    }

    /// Whether this player may change their stored password.
    pub fn may_set_password(&self, authenticated: bool) -> bool {
        authenticated || !self.require_auth_to_set_password
    }
}

impl Authenticator for PasswordFileAuth {
    fn authenticate(&self, req: &AuthRequest) -> AuthResult {
        let Some(name) = clean_name(&req.name_bytes) else {
            return AuthResult::denied(AuthCode::BadName, String::new());
        };
        let password = clean_password(&req.password_bytes);

        match self.entry(&name) {
            Some("lock") => AuthResult::denied(AuthCode::NoPermission, name),
            Some("any") => AuthResult {
                code: AuthCode::Ok,
                authenticated: false,
                send_name: name,
                custom_text: None,
            },
            Some(stored) => {
                if self.hash(&name, &password) == stored {
                    AuthResult {
                        code: AuthCode::Ok,
                        authenticated: true,
                        send_name: name,
                        custom_text: None,
                    }
                } else {
                    AuthResult::denied(AuthCode::BadPassword, name)
                }
            }
            None => {
                if self.allow_unknown {
                    AuthResult {
                        code: AuthCode::Ok,
                        authenticated: false,
                        send_name: name,
                        custom_text: None,
                    }
                } else {
                    AuthResult::denied(AuthCode::NoPermission, name)
                }
            }
        }
    }
}

// ============================================================
// Billing authenticator
// ============================================================

/// Connection to a billing server. The protocol and connection management
/// are outside the core; the core only asks whether the link is up and
/// hands requests over when it is.
pub trait BillingLink: Send {
    fn is_connected(&self) -> bool;
    fn authenticate(&self, req: &AuthRequest) -> AuthResult;
}

pub struct BillingAuth {
    pub link: Option<Box<dyn BillingLink>>,
    pub fallback: PasswordFileAuth,
}

impl Authenticator for BillingAuth {
    fn authenticate(&self, req: &AuthRequest) -> AuthResult {
        if let Some(link) = &self.link {
            if link.is_connected() {
                return link.authenticate(req);
            }
        }

        // Billing down: fall back to the password file.
        let Some(name) = clean_name(&req.name_bytes) else {
            return AuthResult::denied(AuthCode::BadName, String::new());
        };
        let password = clean_password(&req.password_bytes);
        match self.fallback.check_password(&name, &password) {
            (PwMatch::Match, authenticated) => AuthResult {
                code: AuthCode::Ok,
                authenticated,
                send_name: name,
                custom_text: None,
            },
            (PwMatch::Mismatch, _) => AuthResult::denied(AuthCode::BadPassword, name),
            (PwMatch::NotFound, _) => {
                if self.fallback.allow_unknown {
                    AuthResult {
                        code: AuthCode::Ok,
                        authenticated: false,
                        send_name: name,
                        custom_text: None,
                    }
                } else {
                    AuthResult::denied(AuthCode::NoPermission, name)
                }
            }
        }
    }
}

// ============================================================
// Pipeline
// ============================================================

pub struct AuthPipeline {
    primary: Box<dyn Authenticator>,
}

impl AuthPipeline {
    /// Build the configured authenticator stack: the billing authenticator
    /// wraps the password file when a link is provided, otherwise the file
    /// stands alone.
    pub fn new(passwd: ConfDocument, billing: Option<Box<dyn BillingLink>>) -> Self {
        let file_auth = PasswordFileAuth::from_doc(passwd);
        let primary: Box<dyn Authenticator> = match billing {
            Some(link) => Box::new(BillingAuth {
                link: Some(link),
                fallback: file_auth,
            }),
            None => Box::new(file_auth),
        };
        Self { primary }
    }

    pub fn authenticate(&self, req: &AuthRequest) -> AuthResult {
        self.primary.authenticate(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, password: &str) -> AuthRequest {
        let mut name_bytes = name.as_bytes().to_vec();
        name_bytes.resize(32, 0);
        let mut password_bytes = password.as_bytes().to_vec();
        password_bytes.resize(32, 0);
        AuthRequest {
            name_bytes,
            password_bytes,
            client_version: 40,
        }
    }

    fn file_auth(users: &str) -> PasswordFileAuth {
        let doc = ConfDocument::parse(&format!(
            "[General]\nHashAlgorithm = MD5\nHashEncoding = hex\n[users]\n{}",
            users
        ));
        PasswordFileAuth::from_doc(doc)
    }

    #[test]
    fn test_known_user_hex_md5() {
        let stored = compute_password_hash(HashAlgorithm::Md5, HashEncoding::Hex, "bob", "abc");
        assert_eq!(stored.len(), 32);
        assert!(stored.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let auth = file_auth(&format!("bob = {}\n", stored));
        let res = auth.authenticate(&request("Bob", "abc"));
        assert_eq!(res.code, AuthCode::Ok);
        assert!(res.authenticated);
        assert_eq!(res.send_name, "Bob");

        let res = auth.authenticate(&request("bob", "wrong"));
        assert_eq!(res.code, AuthCode::BadPassword);
        assert!(!res.authenticated);
    }

    #[test]
    fn test_any_row_never_authenticates() {
        let auth = file_auth("eve = any\n");
        let res = auth.authenticate(&request("Eve", "whatever"));
        assert_eq!(res.code, AuthCode::Ok);
        assert!(!res.authenticated);
    }

    #[test]
    fn test_lock_row() {
        let auth = file_auth("mallory = lock\n");
        let res = auth.authenticate(&request("mallory", "pw"));
        assert_eq!(res.code, AuthCode::NoPermission);
    }

    #[test]
    fn test_unknown_user_policy() {
        let auth = file_auth("");
        let res = auth.authenticate(&request("newbie", "pw"));
        assert_eq!(res.code, AuthCode::Ok);
        assert!(!res.authenticated);

        let doc = ConfDocument::parse("[General]\nAllowUnknown = 0\n[users]\n");
        let strict = PasswordFileAuth::from_doc(doc);
        let res = strict.authenticate(&request("newbie", "pw"));
        assert_eq!(res.code, AuthCode::NoPermission);
    }

    #[test]
    fn test_bad_names() {
        let auth = file_auth("");
        assert_eq!(
            auth.authenticate(&request("", "pw")).code,
            AuthCode::BadName
        );
        assert_eq!(
            auth.authenticate(&request(":sneaky", "pw")).code,
            AuthCode::BadName
        );
        let mut req = request("ok", "pw");
        req.name_bytes[0] = 0x07;
        assert_eq!(auth.authenticate(&req).code, AuthCode::BadName);
    }

    #[test]
    fn test_hash_lengths_and_determinism() {
        for algo in [HashAlgorithm::Md5, HashAlgorithm::Sha256, HashAlgorithm::Sha512] {
            for encoding in [HashEncoding::Hex, HashEncoding::Base64] {
                let a = compute_password_hash(algo, encoding, "Name", "Password");
                let b = compute_password_hash(algo, encoding, "name", "Password");
                // the name field is lower-cased before hashing
                assert_eq!(a, b);
                assert_eq!(a.len(), encoded_hash_len(algo, encoding));
            }
        }
    }

    #[test]
    fn test_hash_truncation_bounds() {
        // only the first 23 name chars and 31 password chars participate
        let long_name = "abcdefghijklmnopqrstuvwxyz";
        let a = compute_password_hash(HashAlgorithm::Md5, HashEncoding::Hex, long_name, "p");
        let b = compute_password_hash(HashAlgorithm::Md5, HashEncoding::Hex, &long_name[..23], "p");
        assert_eq!(a, b);

        let long_pw = "x".repeat(40);
        let a = compute_password_hash(HashAlgorithm::Md5, HashEncoding::Hex, "n", &long_pw);
        let b = compute_password_hash(HashAlgorithm::Md5, HashEncoding::Hex, "n", &long_pw[..31]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_billing_falls_back_when_down() {
        struct DownLink;
        impl BillingLink for DownLink {
            fn is_connected(&self) -> bool {
                false
            }
            fn authenticate(&self, _req: &AuthRequest) -> AuthResult {
                unreachable!("link is down")
            }
        }

        let stored = compute_password_hash(HashAlgorithm::Md5, HashEncoding::Hex, "bob", "abc");
        let billing = BillingAuth {
            link: Some(Box::new(DownLink)),
            fallback: file_auth(&format!("bob = {}\neve = any\n", stored)),
        };
        let res = billing.authenticate(&request("bob", "abc"));
        assert_eq!(res.code, AuthCode::Ok);
        assert!(res.authenticated);

        let res = billing.authenticate(&request("eve", "anything"));
        assert_eq!(res.code, AuthCode::Ok);
        assert!(!res.authenticated);

        let res = billing.authenticate(&request("bob", "nope"));
        assert_eq!(res.code, AuthCode::BadPassword);
    }
}
