// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Views over rule opcode streams.
//!
//! A rule's match and action logic is an opaque byte buffer: a
//! sequence of variable-length instructions, each a 4-byte header
//! word followed by zero or more payload words. The engine never
//! interprets match semantics; it only needs to walk the stream,
//! validate its structure, and find/patch the embedded object
//! references. Which opcodes reference objects — and where their
//! reference field lives — is the [`OpcodeClassifier`]'s call; the
//! builtin [`StdClassifier`] covers the standard opcode set.

use crate::api::FwError;
use crate::api::ObjType;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::NativeEndian;
use zerocopy::byteorder::U16;
use zerocopy::byteorder::U32;

/// Instruction granularity in bytes. Streams, instruction lengths,
/// and action offsets are all multiples of this.
pub const INSN_WORD: usize = 4;

/// The standard opcode numbers.
pub mod op {
    /// No-op match, always true.
    pub const NOP: u8 = 0;
    pub const IP_SRC: u8 = 1;
    pub const IP_DST: u8 = 2;
    pub const PROTO: u8 = 3;
    pub const PORTS: u8 = 4;

    /// Match source address against a named table.
    pub const TABLE_SRC: u8 = 16;
    /// Match destination address against a named table.
    pub const TABLE_DST: u8 = 17;
    /// Bump a shared named counter and continue matching.
    pub const COUNT: u8 = 18;

    pub const ACCEPT: u8 = 64;
    pub const DENY: u8 = 65;
    /// Jump to the first rule numbered >= `arg`.
    pub const SKIPTO: u8 = 66;
    /// Hand the packet to a named external action.
    pub const EXT_ACT: u8 = 67;
}

/// The leading word of every instruction.
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct InsnHdr {
    pub op: u8,
    /// Instruction length in 4-byte words, this header included.
    pub len: u8,
    /// Immediate argument (port, protocol, skipto target, ...).
    pub arg: U16<NativeEndian>,
}

/// A borrowed view of one instruction within a stream.
#[derive(Clone, Copy, Debug)]
pub struct Insn<'a> {
    /// Byte offset of this instruction within its stream.
    pub offset: usize,
    bytes: &'a [u8],
}

impl<'a> Insn<'a> {
    pub fn op(&self) -> u8 {
        self.bytes[0]
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn arg(&self) -> u16 {
        let (hdr, _) = InsnHdr::ref_from_prefix(self.bytes)
            .expect("insn shorter than its header");
        hdr.arg.get()
    }

    /// The embedded object-reference field (the first payload word),
    /// if the instruction has one.
    pub fn ref_field(&self) -> Option<u32> {
        if self.len_bytes() < 2 * INSN_WORD {
            return None;
        }
        let val = U32::<NativeEndian>::read_from_bytes(
            &self.bytes[INSN_WORD..2 * INSN_WORD],
        )
        .expect("payload word");
        Some(val.get())
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Walk a stream instruction by instruction, surfacing structural
/// damage (truncation, zero-length instructions) as errors. After an
/// error the iterator is exhausted.
pub struct InsnIter<'a> {
    stream: &'a [u8],
    offset: usize,
}

pub fn iter(stream: &[u8]) -> InsnIter<'_> {
    InsnIter { stream, offset: 0 }
}

impl<'a> Iterator for InsnIter<'a> {
    type Item = Result<Insn<'a>, FwError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.stream.len() {
            return None;
        }
        let rem = &self.stream[self.offset..];
        if rem.len() < INSN_WORD {
            self.offset = self.stream.len();
            return Some(Err(FwError::BadRuleSize {
                size: self.stream.len(),
            }));
        }
        let (hdr, _) =
            InsnHdr::ref_from_prefix(rem).expect("4 bytes checked above");
        let len_bytes = hdr.len as usize * INSN_WORD;
        if hdr.len == 0 || len_bytes > rem.len() {
            let err =
                FwError::BadOpcode { op: hdr.op, offset: self.offset };
            self.offset = self.stream.len();
            return Some(Err(err));
        }
        let insn =
            Insn { offset: self.offset, bytes: &rem[..len_bytes] };
        self.offset += len_bytes;
        Some(Ok(insn))
    }
}

/// Read the reference field of the instruction at `insn_off`. Only
/// valid on streams that passed [`validate`]; a short instruction
/// here is engine misuse.
pub fn read_ref(stream: &[u8], insn_off: usize) -> u32 {
    let word = &stream[insn_off + INSN_WORD..insn_off + 2 * INSN_WORD];
    U32::<NativeEndian>::read_from_bytes(word).expect("ref word").get()
}

/// Patch the reference field of the instruction at `insn_off`.
pub fn write_ref(stream: &mut [u8], insn_off: usize, kidx: u32) {
    let word =
        &mut stream[insn_off + INSN_WORD..insn_off + 2 * INSN_WORD];
    word.copy_from_slice(U32::<NativeEndian>::new(kidx).as_bytes());
}

/// Structural role of an instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InsnKind {
    /// A match opcode; must precede the action offset.
    Match,
    /// A terminal action opcode; must start at or follow it.
    Action,
}

/// What a reference opcode points at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ObjRefInfo {
    pub ty: ObjType,
}

/// Classifies opcodes for the engine: which are matches, which are
/// actions, which embed a named-object reference. Implementations
/// must be deterministic; the engine classifies the same stream
/// during validation, resolution, and release.
pub trait OpcodeClassifier: Send + Sync {
    fn classify(&self, insn: &Insn) -> Result<InsnKind, FwError>;

    fn object_ref(&self, insn: &Insn) -> Option<ObjRefInfo>;

    /// Patch the instruction's embedded reference with the final
    /// kidx. The default writes the first payload word.
    fn rewrite(&self, stream: &mut [u8], insn_off: usize, kidx: u32) {
        write_ref(stream, insn_off, kidx);
    }
}

/// The classifier for the standard opcode set.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdClassifier;

impl OpcodeClassifier for StdClassifier {
    fn classify(&self, insn: &Insn) -> Result<InsnKind, FwError> {
        match insn.op() {
            op::NOP | op::IP_SRC | op::IP_DST | op::PROTO | op::PORTS
            | op::TABLE_SRC | op::TABLE_DST | op::COUNT => {
                Ok(InsnKind::Match)
            }
            op::ACCEPT | op::DENY | op::SKIPTO | op::EXT_ACT => {
                Ok(InsnKind::Action)
            }
            other => {
                Err(FwError::BadOpcode { op: other, offset: insn.offset })
            }
        }
    }

    fn object_ref(&self, insn: &Insn) -> Option<ObjRefInfo> {
        let ty = match insn.op() {
            op::TABLE_SRC | op::TABLE_DST => ObjType::TABLE,
            op::COUNT => ObjType::COUNTER,
            op::EXT_ACT => ObjType::EXT_ACTION,
            _ => return None,
        };
        Some(ObjRefInfo { ty })
    }
}

/// An object reference discovered during validation: where it sits
/// in the stream, what type it wants, and the logical name-table
/// index it embeds pre-rewrite.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RefSite {
    pub insn_off: usize,
    pub ty: ObjType,
    pub logical: u32,
}

/// Validate a stream's structure against the classifier and collect
/// its reference sites.
///
/// A valid stream is a nonzero multiple of 4 bytes; every
/// instruction classifies; match opcodes all precede `action_offset`;
/// `action_offset` lands exactly on an action instruction; and every
/// reference opcode carries a payload word for its reference field.
pub fn validate(
    stream: &[u8],
    action_offset: usize,
    classifier: &dyn OpcodeClassifier,
) -> Result<Vec<RefSite>, FwError> {
    if stream.is_empty() || stream.len() % INSN_WORD != 0 {
        return Err(FwError::BadRuleSize { size: stream.len() });
    }
    let bad_offset = FwError::BadActionOffset {
        offset: action_offset as u32,
        size: stream.len(),
    };
    if action_offset >= stream.len() || action_offset % INSN_WORD != 0 {
        return Err(bad_offset);
    }

    let mut sites = Vec::new();
    let mut on_boundary = false;
    for insn in iter(stream) {
        let insn = insn?;
        if insn.offset == action_offset {
            on_boundary = true;
        }
        let kind = classifier.classify(&insn)?;
        match kind {
            InsnKind::Match if insn.offset >= action_offset => {
                return Err(bad_offset);
            }
            InsnKind::Action if insn.offset < action_offset => {
                return Err(bad_offset);
            }
            _ => (),
        }
        if let Some(info) = classifier.object_ref(&insn) {
            let Some(logical) = insn.ref_field() else {
                return Err(FwError::BadOpcode {
                    op: insn.op(),
                    offset: insn.offset,
                });
            };
            sites.push(RefSite {
                insn_off: insn.offset,
                ty: info.ty,
                logical,
            });
        }
    }
    if !on_boundary {
        return Err(bad_offset);
    }
    Ok(sites)
}

/// Assembly helpers for building opcode streams. The engine has no
/// use for these itself; control-channel frontends and tests do.
pub mod build {
    use super::INSN_WORD;
    use super::InsnHdr;
    use zerocopy::IntoBytes;
    use zerocopy::byteorder::NativeEndian;
    use zerocopy::byteorder::U16;
    use zerocopy::byteorder::U32;

    /// A one-word instruction: header only.
    pub fn insn(op: u8, arg: u16) -> Vec<u8> {
        InsnHdr { op, len: 1, arg: U16::new(arg) }.as_bytes().to_vec()
    }

    /// A two-word reference instruction: header plus the embedded
    /// reference field, pre-rewrite holding a logical name index.
    pub fn insn_ref(op: u8, logical: u32) -> Vec<u8> {
        let mut bytes =
            InsnHdr { op, len: 2, arg: U16::new(0) }.as_bytes().to_vec();
        bytes.extend_from_slice(
            U32::<NativeEndian>::new(logical).as_bytes(),
        );
        debug_assert_eq!(bytes.len(), 2 * INSN_WORD);
        bytes
    }

    /// Concatenate instructions into a stream.
    pub fn stream(insns: &[Vec<u8>]) -> Vec<u8> {
        insns.concat()
    }
}
