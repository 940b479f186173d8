//! Composite master keys assembled from passwords, key files and
//! challenge-response responders

use std::io::Read;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose as base64_engine, Engine as _};
use cipher::generic_array::{typenum::U32, GenericArray};
use xml::name::OwnedName;
use xml::reader::{EventReader, XmlEvent};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypt::calculate_sha256;
use crate::error::DatabaseKeyError;

pub type KeyElement = Vec<u8>;

/// How long to wait for a challenge-response responder before giving up
pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(10);

/// How many leading bytes of a keyfile are searched for the `<KeyFile>` tag
const XML_DETECTION_WINDOW: usize = 120;

/// A callback that answers a key challenge, e.g. by talking to a hardware
/// token. The challenge is the seed from the database header; the response
/// participates in the composite key.
#[derive(Clone)]
pub struct ChallengeResponseKey {
    responder: Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>,
}

impl ChallengeResponseKey {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
        }
    }

    /// Run the responder on a worker thread, bounded by `timeout`.
    ///
    /// Responders may block on hardware indefinitely; on timeout the worker
    /// is abandoned and the key operation fails with
    /// [DatabaseKeyError::ChallengeResponseTimeout].
    fn respond(&self, challenge: &[u8], timeout: Duration) -> Result<Vec<u8>, DatabaseKeyError> {
        let (sender, receiver) = mpsc::channel();
        let responder = Arc::clone(&self.responder);
        let challenge = challenge.to_vec();

        std::thread::spawn(move || {
            let _ = sender.send(responder(&challenge));
        });

        match receiver.recv_timeout(timeout) {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(message)) => Err(DatabaseKeyError::ChallengeResponse(message)),
            Err(_) => Err(DatabaseKeyError::ChallengeResponseTimeout(timeout)),
        }
    }
}

impl std::fmt::Debug for ChallengeResponseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeResponseKey").finish_non_exhaustive()
    }
}

impl PartialEq for ChallengeResponseKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.responder, &other.responder)
    }
}

/// Attempt to read an XML keyfile.
///
/// `Ok(None)` means the buffer is not a well-formed XML keyfile and the
/// caller should fall back to the other key forms. A recognized keyfile
/// with a failing integrity check is a hard error.
fn parse_xml_keyfile(xml: &[u8]) -> Result<Option<KeyElement>, DatabaseKeyError> {
    let parser = EventReader::new(xml);

    let mut tag_stack = Vec::new();

    let mut key_version: Option<String> = None;
    let mut key_value: Option<String> = None;
    let mut key_hash: Option<String> = None;

    for ev in parser {
        let ev = match ev {
            Ok(ev) => ev,
            Err(_) => return Ok(None),
        };

        match ev {
            XmlEvent::StartElement {
                name: OwnedName { ref local_name, .. },
                ref attributes,
                ..
            } => {
                tag_stack.push(local_name.clone());

                if tag_stack == ["KeyFile", "Key", "Data"] {
                    key_hash = attributes
                        .iter()
                        .find(|a| a.name.local_name == "Hash")
                        .map(|a| a.value.clone());
                }
            }
            XmlEvent::EndElement { .. } => {
                tag_stack.pop();
            }
            XmlEvent::Characters(s) => {
                if tag_stack == ["KeyFile", "Meta", "Version"] {
                    key_version = Some(s);
                } else if tag_stack == ["KeyFile", "Key", "Data"] {
                    key_value = Some(s);
                }
            }
            _ => {}
        }
    }

    let key_value = match key_value {
        Some(v) => v,
        None => return Ok(None),
    };

    if key_version.as_deref().map(|v| v.starts_with("2.")) == Some(true) {
        // version 2.0: hex payload with a 4-byte SHA-256 prefix in the Hash
        // attribute
        let stripped: String = key_value.chars().filter(|c| !c.is_whitespace()).collect();
        let key = hex::decode(&stripped).map_err(|_| DatabaseKeyError::InvalidKeyFile)?;

        let hash = key_hash.ok_or(DatabaseKeyError::InvalidKeyFile)?;
        let hash = hex::decode(hash.trim()).map_err(|_| DatabaseKeyError::InvalidKeyFile)?;

        if calculate_sha256(&[&key])[0..4] != hash[..] {
            return Err(DatabaseKeyError::InvalidKeyFile);
        }

        return Ok(Some(key));
    }

    // version 1.0: Base64 payload of the raw key. Data that does not decode
    // is taken verbatim, matching what other implementations accept.
    match base64_engine::STANDARD.decode(key_value.trim()) {
        Ok(key) => Ok(Some(key)),
        Err(_) => Ok(Some(key_value.into_bytes())),
    }
}

/// Obtain a key element from keyfile contents.
///
/// Detection order: XML keyfile, 32-byte binary key, 64 hex characters,
/// SHA-256 of the whole file.
fn parse_keyfile(buffer: &[u8]) -> Result<KeyElement, DatabaseKeyError> {
    let window = &buffer[..buffer.len().min(XML_DETECTION_WINDOW)];
    let looks_like_xml = window
        .windows(b"<KeyFile>".len())
        .any(|w| w == b"<KeyFile>");

    if looks_like_xml {
        if let Some(key) = parse_xml_keyfile(buffer)? {
            return Ok(key);
        }
    }

    if buffer.len() == 32 {
        // legacy binary key format
        return Ok(buffer.to_vec());
    }

    if buffer.len() == 64 {
        if let Ok(key) = hex::decode(buffer) {
            return Ok(key);
        }
    }

    Ok(calculate_sha256(&[buffer]).as_slice().to_vec())
}

/// A composite database key built from a password, a keyfile and/or
/// challenge-response responders
#[derive(Debug, Clone, Default, PartialEq, Zeroize, ZeroizeOnDrop)]
pub struct DatabaseKey {
    password: Option<String>,
    keyfile: Option<Vec<u8>>,
    #[zeroize(skip)]
    challenge_response_keys: Vec<ChallengeResponseKey>,
}

impl DatabaseKey {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_keyfile(mut self, keyfile: &mut dyn Read) -> Result<Self, std::io::Error> {
        let mut buf = Vec::new();
        keyfile.read_to_end(&mut buf)?;

        self.keyfile = Some(buf);

        Ok(self)
    }

    pub fn with_challenge_response_key(mut self, key: ChallengeResponseKey) -> Self {
        self.challenge_response_keys.push(key);
        self
    }

    /// Returns true if the database key is not associated with any key component.
    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.keyfile.is_none() && self.challenge_response_keys.is_empty()
    }

    pub(crate) fn has_challenge_keys(&self) -> bool {
        !self.challenge_response_keys.is_empty()
    }

    /// Collect the raw keys of all components, in order.
    ///
    /// `challenge` is the header seed presented to challenge-response
    /// components; their responses are hashed into a single digest that
    /// participates as the final element.
    pub(crate) fn get_key_elements(
        &self,
        challenge: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Vec<KeyElement>, DatabaseKeyError> {
        if self.is_empty() {
            return Err(DatabaseKeyError::MissingKey);
        }

        let mut out = Vec::new();

        if let Some(p) = &self.password {
            out.push(calculate_sha256(&[p.as_bytes()]).to_vec());
        }

        if let Some(ref f) = self.keyfile {
            out.push(parse_keyfile(f)?);
        }

        if !self.challenge_response_keys.is_empty() {
            let challenge = challenge.ok_or_else(|| {
                DatabaseKeyError::ChallengeResponse("no challenge available for key".to_string())
            })?;

            let mut responses: Vec<Vec<u8>> = Vec::new();
            for key in &self.challenge_response_keys {
                responses.push(key.respond(challenge, timeout)?);
            }

            let response_refs: Vec<&[u8]> = responses.iter().map(|r| &r[..]).collect();
            out.push(calculate_sha256(&response_refs).to_vec());

            for mut response in responses {
                response.zeroize();
            }
        }

        Ok(out)
    }

    /// Compute the composite raw key: the SHA-256 over all component raw
    /// keys in order. The component buffers are erased before returning.
    pub(crate) fn composite_key(
        &self,
        challenge: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<GenericArray<u8, U32>, DatabaseKeyError> {
        let mut elements = self.get_key_elements(challenge, timeout)?;

        let refs: Vec<&[u8]> = elements.iter().map(|v| &v[..]).collect();
        let composite = calculate_sha256(&refs);

        for element in elements.iter_mut() {
            element.zeroize();
        }

        Ok(composite)
    }
}
