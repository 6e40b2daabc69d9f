// Licensed under the Apache-2.0 license

//! The ancast firmware container format.
//!
//! An ancast image is a fixed header, a signature block (one of two
//! fixed-size variants selected by a type tag), an info block carrying the
//! body size, SHA-1 body digest, version and target device, and finally the
//! opaque body. [`AncastImage::parse`] validates the structure,
//! [`AncastImage::verify`] the content; both are all-or-nothing, and no
//! field is trusted until the whole check passes.
//!
//! Verification here is structural plus the body digest. The signature
//! payload itself is carried but **not** cryptographically checked; see
//! [`AncastImage::verify`].

use boot1_hil::{cbc_decrypt, AesCore, AES_BLOCK_SIZE};
use constant_time_eq::constant_time_eq;
use core::mem::size_of;
use sha1::{Digest, Sha1};
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const ANCAST_MAGIC: u32 = 0xEFA2_82D9;

/// Signature block offset this system expects in images it manages.
pub const EXPECTED_SIGNATURE_OFFSET: u32 = 0x20;

/// Absolute info-block offsets implied by the two signature types.
const TYPE1_INFO_OFFSET: usize = 0xA0;
const TYPE2_INFO_OFFSET: usize = 0x1A0;

pub const SHA_HASH_SIZE: usize = 20;

/// IV used for encrypted IOP bodies.
pub const BODY_IV: [u8; AES_BLOCK_SIZE] = [
    0x91, 0xc9, 0xd0, 0x08, 0x31, 0x28, 0x51, 0xef, 0x6b, 0x22, 0x8b, 0xf1, 0x4b, 0xad, 0x43,
    0x22,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AncastError {
    #[error("image truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("bad ancast magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("signature block offset is 0x{0:x}, expected 0x{EXPECTED_SIGNATURE_OFFSET:x}")]
    BadSignatureOffset(u32),
    #[error("unrecognized signature type 0x{0:x}")]
    UnknownSignatureType(u32),
    #[error("signature block null padding is not empty")]
    SignaturePadNotZero,
    #[error("info block reserved fields are not empty")]
    ReservedNotZero,
    #[error("body SHA-1 digest does not match the info block")]
    BodyHashMismatch,
    #[error("image targets device class {found}, expected {expected}")]
    WrongTarget { expected: u8, found: u8 },
    #[error("no load address for device code 0x{0:02x}")]
    UnknownLoadAddress(u32),
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct AncastHeader {
    pub magic: U32<LittleEndian>,
    pub pad0: [u8; 0x04],
    pub signature_block_offset: U32<LittleEndian>,
    pub pad1: [u8; 0x14],
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Type1Signature {
    pub signature: [u8; 0x38],
    pub nullpad: [u8; 0x44],
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Type2Signature {
    pub signature: [u8; 0x100],
    pub nullpad: [u8; 0x7c],
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct InfoBlock {
    pub nullpad0: U16<LittleEndian>,
    pub nullpad1: u8,
    pub nullpad2: u8,
    pub device: U32<LittleEndian>,
    pub image_type: U32<LittleEndian>,
    pub body_size: U32<LittleEndian>,
    pub body_hash: [u8; SHA_HASH_SIZE],
    pub version: U32<LittleEndian>,
    pub nullpad3: [u8; 0x38],
}

/// The two recognized signature variants, keyed by the 4-byte type tag that
/// precedes them.
pub enum SignatureBlock<'a> {
    Type1(&'a Type1Signature),
    Type2(&'a Type2Signature),
}

impl SignatureBlock<'_> {
    pub fn type_tag(&self) -> u32 {
        match self {
            SignatureBlock::Type1(_) => 1,
            SignatureBlock::Type2(_) => 2,
        }
    }

    pub fn signature(&self) -> &[u8] {
        match self {
            SignatureBlock::Type1(s) => &s.signature,
            SignatureBlock::Type2(s) => &s.signature,
        }
    }

    fn nullpad(&self) -> &[u8] {
        match self {
            SignatureBlock::Type1(s) => &s.nullpad,
            SignatureBlock::Type2(s) => &s.nullpad,
        }
    }
}

/// Device classes encoded in the high nibble of the info block's `device`
/// field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Target {
    Ppc = 0x01,
    Iop = 0x02,
}

/// A parsed (structurally valid) view into an ancast image.
pub struct AncastImage<'a> {
    bytes: &'a [u8],
    header: &'a AncastHeader,
    signature: SignatureBlock<'a>,
    info: &'a InfoBlock,
    body_offset: usize,
}

fn slice(bytes: &[u8], offset: usize, len: usize) -> Result<&[u8], AncastError> {
    bytes
        .get(offset..offset + len)
        .ok_or(AncastError::Truncated {
            need: offset + len,
            have: bytes.len(),
        })
}

impl<'a> AncastImage<'a> {
    /// Parse the container structure: magic, signature block location and
    /// type, info block, and body bounds.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, AncastError> {
        let header = AncastHeader::ref_from_bytes(slice(bytes, 0, size_of::<AncastHeader>())?)
            .expect("header layout is unaligned and sized");

        let magic = header.magic.get();
        if magic != ANCAST_MAGIC {
            return Err(AncastError::BadMagic(magic));
        }

        let sig_offset = header.signature_block_offset.get() as usize;
        let tag = u32::from_le_bytes(slice(bytes, sig_offset, 4)?.try_into().unwrap());

        let (signature, info_offset) = match tag {
            1 => {
                let raw = slice(bytes, sig_offset + 4, size_of::<Type1Signature>())?;
                let sig = Type1Signature::ref_from_bytes(raw).expect("unaligned");
                (SignatureBlock::Type1(sig), TYPE1_INFO_OFFSET)
            }
            2 => {
                let raw = slice(bytes, sig_offset + 4, size_of::<Type2Signature>())?;
                let sig = Type2Signature::ref_from_bytes(raw).expect("unaligned");
                (SignatureBlock::Type2(sig), TYPE2_INFO_OFFSET)
            }
            other => return Err(AncastError::UnknownSignatureType(other)),
        };

        let info =
            InfoBlock::ref_from_bytes(slice(bytes, info_offset, size_of::<InfoBlock>())?)
                .expect("unaligned");

        let body_offset = info_offset + size_of::<InfoBlock>();
        // The whole body must be present; a short image is rejected here
        // rather than surfacing later as a bad digest.
        slice(bytes, body_offset, info.body_size.get() as usize)?;

        Ok(AncastImage {
            bytes,
            header,
            signature,
            info,
            body_offset,
        })
    }

    pub fn header(&self) -> &AncastHeader {
        self.header
    }

    pub fn signature(&self) -> &SignatureBlock<'a> {
        &self.signature
    }

    pub fn info(&self) -> &InfoBlock {
        self.info
    }

    pub fn version(&self) -> u32 {
        self.info.version.get()
    }

    /// Exactly `body_size` bytes following the info block.
    pub fn body(&self) -> &[u8] {
        &self.bytes[self.body_offset..self.body_offset + self.info.body_size.get() as usize]
    }

    /// Target device class and subtype from the info block.
    pub fn device_class(&self) -> (u8, u8) {
        let device = self.info.device.get() as u8;
        (device >> 4, device & 0x0f)
    }

    fn reserved_fields_zero(&self) -> bool {
        self.info.nullpad0.get() == 0
            && self.info.nullpad1 == 0
            && self.info.nullpad2 == 0
            && self.info.nullpad3.iter().all(|&b| b == 0)
    }

    /// Structural verification of an image this system manages: the
    /// authored signature-block offset, the signature padding, and the
    /// reserved info-block fields. The RSA signature carried in the
    /// signature block is *not* verified; passing this check is not a
    /// substitute for signature verification.
    // TODO: verify the info block RSA signature once a key source exists.
    pub fn verify_structure(&self) -> Result<(), AncastError> {
        let sig_offset = self.header.signature_block_offset.get();
        if sig_offset != EXPECTED_SIGNATURE_OFFSET {
            return Err(AncastError::BadSignatureOffset(sig_offset));
        }

        if self.signature.nullpad().iter().any(|&b| b != 0) {
            return Err(AncastError::SignaturePadNotZero);
        }

        if !self.reserved_fields_zero() {
            return Err(AncastError::ReservedNotZero);
        }

        Ok(())
    }

    /// [`AncastImage::verify_structure`] plus the SHA-1 digest over the
    /// body as stored. An encrypted IOP body carries the digest of its
    /// plaintext instead; [`load_for`] is the check for those.
    pub fn verify(&self) -> Result<(), AncastError> {
        self.verify_structure()?;

        let digest = Sha1::digest(self.body());
        if !constant_time_eq(&digest, &self.info.body_hash) {
            return Err(AncastError::BodyHashMismatch);
        }

        Ok(())
    }
}

/// A body prepared for execution on its target.
pub struct LoadedImage {
    pub load_address: u32,
    pub device: u32,
    pub version: u32,
    pub body: Vec<u8>,
}

fn load_address(target: u8, subtype: u8) -> Option<u32> {
    match (target, subtype) {
        (t, 0x01) if t == Target::Ppc as u8 => Some(0x0800_0000),
        (t, 0x03) if t == Target::Ppc as u8 => Some(0x0133_0000),
        (t, _) if t == Target::Iop as u8 => Some(0x0100_0000),
        _ => None,
    }
}

/// Parse an image for a specific device class, resolve its load address,
/// decrypt the body when the info block indicates an encrypted IOP payload,
/// and check the body digest over the plaintext.
pub fn load_for(
    bytes: &[u8],
    expected: Target,
    aes: &mut dyn AesCore,
    ancast_key: &[u8; AES_BLOCK_SIZE],
) -> Result<LoadedImage, AncastError> {
    let image = AncastImage::parse(bytes)?;

    let (target, subtype) = image.device_class();
    if target != expected as u8 {
        return Err(AncastError::WrongTarget {
            expected: expected as u8,
            found: target,
        });
    }

    let device = image.info.device.get();
    let load_address =
        load_address(target, subtype).ok_or(AncastError::UnknownLoadAddress(device))?;

    let mut body = image.body().to_vec();

    // Bit 0 of the first reserved field clear means the IOP body is stored
    // encrypted.
    if expected == Target::Iop && image.info.nullpad0.get() & 1 == 0 {
        log::info!("ancast: decrypting {} body blocks", body.len() / AES_BLOCK_SIZE);
        aes.reset();
        aes.set_key(ancast_key);
        aes.set_iv(&BODY_IV);
        let whole_blocks = body.len() & !(AES_BLOCK_SIZE - 1);
        cbc_decrypt(aes, &mut body[..whole_blocks]);
    }

    let digest = Sha1::digest(&body);
    if !constant_time_eq(&digest, &image.info.body_hash) {
        return Err(AncastError::BodyHashMismatch);
    }

    Ok(LoadedImage {
        load_address,
        device,
        version: image.version(),
        body,
    })
}
