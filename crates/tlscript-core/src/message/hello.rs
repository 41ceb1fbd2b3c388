//! Hello message bodies: the fields the connection context tracks.

use tlscript_types::CodecError;

use super::ProtocolMessage;
use crate::handshake::HandshakeType;
use crate::{CipherSuite, CompressionMethod, ExtensionType, ProtocolVersion};

/// Big-endian cursor over a message body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(CodecError::incomplete(what, end, self.data.len()));
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, CodecError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, CodecError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn vec8(&mut self, what: &'static str) -> Result<&'a [u8], CodecError> {
        let len = self.u8(what)? as usize;
        self.take(len, what)
    }

    fn vec16(&mut self, what: &'static str) -> Result<&'a [u8], CodecError> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}

fn parse_extensions(r: &mut Reader<'_>) -> Result<Vec<(ExtensionType, Vec<u8>)>, CodecError> {
    if r.is_empty() {
        return Ok(Vec::new());
    }
    let mut ext = Reader::new(r.vec16("extensions")?);
    let mut out = Vec::new();
    while !ext.is_empty() {
        let ty = ExtensionType(ext.u16("extension type")?);
        let data = ext.vec16("extension data")?;
        out.push((ty, data.to_vec()));
    }
    Ok(out)
}

fn write_extensions(out: &mut Vec<u8>, extensions: &[(ExtensionType, Vec<u8>)]) {
    if extensions.is_empty() {
        return;
    }
    let mut block = Vec::new();
    for (ty, data) in extensions {
        block.extend_from_slice(&ty.0.to_be_bytes());
        block.extend_from_slice(&(data.len() as u16).to_be_bytes());
        block.extend_from_slice(data);
    }
    out.extend_from_slice(&(block.len() as u16).to_be_bytes());
    out.extend_from_slice(&block);
}

fn write_vec8(out: &mut Vec<u8>, data: &[u8]) {
    out.push(data.len() as u8);
    out.extend_from_slice(data);
}

/// ClientHello body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub version: ProtocolVersion,
    pub random: Vec<u8>,
    pub session_id: Vec<u8>,
    /// DTLS only.
    pub cookie: Option<Vec<u8>>,
    pub cipher_suites: Vec<CipherSuite>,
    pub compression_methods: Vec<CompressionMethod>,
    pub extensions: Vec<(ExtensionType, Vec<u8>)>,
}

impl ClientHello {
    pub fn new(version: ProtocolVersion, random: [u8; 32], cipher_suites: Vec<CipherSuite>) -> Self {
        Self {
            version,
            random: random.to_vec(),
            session_id: Vec::new(),
            cookie: version.is_dtls().then(Vec::new),
            cipher_suites,
            compression_methods: vec![CompressionMethod::NULL],
            extensions: Vec::new(),
        }
    }

    pub fn parse(body: &[u8], dtls: bool) -> Result<Self, CodecError> {
        let mut r = Reader::new(body);
        let version = ProtocolVersion(r.u16("client version")?);
        let random = r.take(32, "client random")?.to_vec();
        let session_id = r.vec8("session id")?.to_vec();
        let cookie = if dtls {
            Some(r.vec8("cookie")?.to_vec())
        } else {
            None
        };
        let suites = r.vec16("cipher suites")?;
        let cipher_suites = suites
            .chunks_exact(2)
            .map(|c| CipherSuite(u16::from_be_bytes([c[0], c[1]])))
            .collect();
        let compression_methods = r
            .vec8("compression methods")?
            .iter()
            .map(|&m| CompressionMethod(m))
            .collect();
        let extensions = parse_extensions(&mut r)?;
        Ok(Self {
            version,
            random,
            session_id,
            cookie,
            cipher_suites,
            compression_methods,
            extensions,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.random);
        write_vec8(&mut out, &self.session_id);
        if let Some(cookie) = &self.cookie {
            write_vec8(&mut out, cookie);
        }
        out.extend_from_slice(&((self.cipher_suites.len() * 2) as u16).to_be_bytes());
        for suite in &self.cipher_suites {
            out.extend_from_slice(&suite.0.to_be_bytes());
        }
        out.push(self.compression_methods.len() as u8);
        out.extend(self.compression_methods.iter().map(|m| m.0));
        write_extensions(&mut out, &self.extensions);
        out
    }

    pub fn to_message(&self) -> ProtocolMessage {
        ProtocolMessage::handshake(HandshakeType::ClientHello, self.to_bytes())
    }
}

/// ServerHello body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub version: ProtocolVersion,
    pub random: Vec<u8>,
    pub session_id: Vec<u8>,
    pub cipher_suite: CipherSuite,
    pub compression_method: CompressionMethod,
    pub extensions: Vec<(ExtensionType, Vec<u8>)>,
}

impl ServerHello {
    pub fn new(version: ProtocolVersion, random: [u8; 32], cipher_suite: CipherSuite) -> Self {
        Self {
            version,
            random: random.to_vec(),
            session_id: Vec::new(),
            cipher_suite,
            compression_method: CompressionMethod::NULL,
            extensions: Vec::new(),
        }
    }

    pub fn parse(body: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(body);
        let version = ProtocolVersion(r.u16("server version")?);
        let random = r.take(32, "server random")?.to_vec();
        let session_id = r.vec8("session id")?.to_vec();
        let cipher_suite = CipherSuite(r.u16("cipher suite")?);
        let compression_method = CompressionMethod(r.u8("compression method")?);
        let extensions = parse_extensions(&mut r)?;
        Ok(Self {
            version,
            random,
            session_id,
            cipher_suite,
            compression_method,
            extensions,
        })
    }

    /// Negotiated version: `supported_versions` overrides the legacy field.
    pub fn selected_version(&self) -> ProtocolVersion {
        self.extensions
            .iter()
            .find(|(ty, data)| *ty == ExtensionType::SUPPORTED_VERSIONS && data.len() == 2)
            .map(|(_, data)| ProtocolVersion(u16::from_be_bytes([data[0], data[1]])))
            .unwrap_or(self.version)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.random);
        write_vec8(&mut out, &self.session_id);
        out.extend_from_slice(&self.cipher_suite.0.to_be_bytes());
        out.push(self.compression_method.0);
        write_extensions(&mut out, &self.extensions);
        out
    }

    pub fn to_message(&self) -> ProtocolMessage {
        ProtocolMessage::handshake(HandshakeType::ServerHello, self.to_bytes())
    }
}

/// DTLS HelloVerifyRequest body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub version: ProtocolVersion,
    pub cookie: Vec<u8>,
}

impl HelloVerifyRequest {
    pub fn parse(body: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(body);
        let version = ProtocolVersion(r.u16("server version")?);
        let cookie = r.vec8("cookie")?.to_vec();
        Ok(Self { version, cookie })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.cookie.len());
        out.extend_from_slice(&self.version.to_be_bytes());
        write_vec8(&mut out, &self.cookie);
        out
    }

    pub fn to_message(&self) -> ProtocolMessage {
        ProtocolMessage::handshake(HandshakeType::HelloVerifyRequest, self.to_bytes())
    }
}
