//! Integer codecs for block payloads.
//!
//! Two packed forms are used by the stored-block decoders:
//!
//! - **PFOR streams**: patched frame-of-reference coding in 128-value
//!   chunks. Each chunk picks the bit width that minimises total storage;
//!   values that do not fit are patched back in from an exception list
//!   (position + high bits). The stream embeds its value count.
//! - **Fixed-slot bit packing**: `subblock_size` values packed at `b` bits
//!   each into u32 words, with a constant payload size per subblock so the
//!   reader can seek by multiplication (bool bitmaps, table indices).
//!
//! Codecs are selected by name through [`create_int_codec`]; the names are
//! persisted in the store settings, so unknown names are a hard error.

use crate::error::{Error, Result};

/// Values per PFOR chunk.
pub const CODEC_BLOCK_SIZE: usize = 128;

// ── Value plumbing ────────────────────────────────────────────────────────

/// Storage integer of an attribute value stream (u32 or u64).
pub trait IntValue: Copy + Default + Eq {
    const BITS: u8;
    fn to_u64(self) -> u64;
    fn from_u64(v: u64) -> Self;
    /// The comparison domain used by filters (signed 64-bit).
    fn cmp_value(self) -> i64;
    /// Append the value's little-endian bytes.
    fn push_le(self, out: &mut Vec<u8>);
    /// Width-appropriate stream decode through the codec interface.
    fn decode_with(codec: &dyn IntCodec, bytes: &[u8], out: &mut Vec<Self>) -> Result<()>;
    fn encode_with(codec: &dyn IntCodec, values: &[Self], out: &mut Vec<u8>);
}

impl IntValue for u32 {
    const BITS: u8 = 32;
    #[inline]
    fn to_u64(self) -> u64 {
        self as u64
    }
    #[inline]
    fn from_u64(v: u64) -> Self {
        v as u32
    }
    #[inline]
    fn cmp_value(self) -> i64 {
        self as i64
    }
    #[inline]
    fn push_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn decode_with(codec: &dyn IntCodec, bytes: &[u8], out: &mut Vec<Self>) -> Result<()> {
        codec.decode32(bytes, out)
    }
    fn encode_with(codec: &dyn IntCodec, values: &[Self], out: &mut Vec<u8>) {
        codec.encode32(values, out)
    }
}

impl IntValue for u64 {
    const BITS: u8 = 64;
    #[inline]
    fn to_u64(self) -> u64 {
        self
    }
    #[inline]
    fn from_u64(v: u64) -> Self {
        v
    }
    #[inline]
    fn cmp_value(self) -> i64 {
        self as i64
    }
    #[inline]
    fn push_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn decode_with(codec: &dyn IntCodec, bytes: &[u8], out: &mut Vec<Self>) -> Result<()> {
        codec.decode64(bytes, out)
    }
    fn encode_with(codec: &dyn IntCodec, values: &[Self], out: &mut Vec<u8>) {
        codec.encode64(values, out)
    }
}

/// Minimum number of bits needed to represent `val`.
#[inline]
pub fn bits_needed(val: u64) -> u8 {
    if val == 0 {
        0
    } else {
        64 - val.leading_zeros() as u8
    }
}

/// Bits per index for a dictionary of `len` entries (indices are `0..len`).
#[inline]
pub fn bits_for_table(len: usize) -> u8 {
    debug_assert!(len >= 1);
    bits_needed(len as u64 - 1)
}

// ── Varints (LEB128) ──────────────────────────────────────────────────────

pub(crate) fn put_vint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn take_vint(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*pos)
            .ok_or_else(|| Error::Corruption("truncated varint".into()))?;
        *pos += 1;
        if shift == 63 && byte > 1 {
            return Err(Error::Corruption("varint exceeds 64 bits".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

// ── Fixed-slot bit packing over u32 words ─────────────────────────────────

/// Word count of one packed subblock: `slots` values at `bits` bits each.
#[inline]
pub fn packed_word_count(slots: usize, bits: u8) -> usize {
    debug_assert!(slots % 32 == 0);
    (slots >> 5) * bits as usize
}

/// Pack `values` at `bits` bits each into `out` (must be zeroed,
/// `packed_word_count` words long). Slots past `values.len()` stay zero.
pub fn bitpack_slots(values: &[u32], bits: u8, out: &mut [u32]) {
    if bits == 0 {
        return;
    }
    let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
    for (i, &v) in values.iter().enumerate() {
        let v = v & mask;
        let bit_pos = i * bits as usize;
        let word = bit_pos >> 5;
        let shift = bit_pos & 31;
        out[word] |= v << shift;
        if shift + bits as usize > 32 {
            out[word + 1] |= v >> (32 - shift);
        }
    }
}

/// Unpack `out.len()` values at `bits` bits each from `words`.
pub fn bitunpack_slots(words: &[u32], bits: u8, out: &mut [u32]) {
    if bits == 0 {
        out.fill(0);
        return;
    }
    let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
    for (i, o) in out.iter_mut().enumerate() {
        let bit_pos = i * bits as usize;
        let word = bit_pos >> 5;
        let shift = bit_pos & 31;
        let mut v = words[word] >> shift;
        if shift + bits as usize > 32 {
            v |= words[word + 1] << (32 - shift);
        }
        *o = v & mask;
    }
}

// ── PFOR chunk packing ────────────────────────────────────────────────────

/// Find the bit width minimising main-array + exception storage for a chunk.
fn find_optimal_bit_width(values: &[u64], max_bits: u8) -> u8 {
    if values.is_empty() {
        return 0;
    }

    let n = values.len();
    // Exceptions are patched one by one; past ~10% of the chunk a wider main
    // array wins.
    let max_exceptions = n.div_ceil(10);

    let mut bit_counts = [0usize; 65];
    for &v in values {
        bit_counts[bits_needed(v) as usize] += 1;
    }
    let mut cumulative = [0usize; 65];
    cumulative[0] = bit_counts[0];
    for b in 1..=max_bits as usize {
        cumulative[b] = cumulative[b - 1] + bit_counts[b];
    }

    let mut best_bits = max_bits;
    let mut best_total = usize::MAX;

    for b in 0..=max_bits {
        let exceptions = n - cumulative[b as usize];
        if exceptions > max_exceptions && b < max_bits {
            continue;
        }
        // position byte + high bits, rounded up to varint bytes
        let exception_bits = exceptions * (8 + ((max_bits - b) as usize).div_ceil(7) * 8);
        let total = n * b as usize + exception_bits;
        if total < best_total {
            best_total = total;
            best_bits = b;
        }
    }

    best_bits
}

/// Pack the low `bits` of every value into a byte array.
fn pack_low_bits(values: &[u64], bits: u8, out: &mut Vec<u8>) {
    let bpv = bits as usize;
    let total_bytes = (values.len() * bpv).div_ceil(8);
    let start = out.len();
    out.resize(start + total_bytes, 0);
    let buf = &mut out[start..];

    for (i, &val) in values.iter().enumerate() {
        let bit_offset = i * bpv;
        let mut bo = bit_offset / 8;
        let mut bs = bit_offset % 8;
        let mut remaining = bpv;
        let mut v = if bits >= 64 { val } else { val & ((1u64 << bits) - 1) };

        while remaining > 0 {
            let can_write = (8 - bs).min(remaining);
            let mask = (1u64 << can_write) - 1;
            buf[bo] |= ((v & mask) << bs) as u8;
            v >>= can_write;
            remaining -= can_write;
            bo += 1;
            bs = 0;
        }
    }
}

/// Read the value at `index` from bit-packed data.
///
/// Fast path: one unaligned little-endian u64 load covering the target bits.
#[inline]
fn read_low_bits(data: &[u8], bits: u8, index: usize) -> u64 {
    let bpv = bits as usize;
    let bit_offset = index * bpv;
    let byte_offset = bit_offset / 8;
    let bit_shift = bit_offset % 8;

    if bit_shift + bpv <= 64 && byte_offset + 8 <= data.len() {
        let raw = u64::from_le_bytes(data[byte_offset..byte_offset + 8].try_into().unwrap());
        let mask = if bpv >= 64 { u64::MAX } else { (1u64 << bpv) - 1 };
        return (raw >> bit_shift) & mask;
    }

    // Slow path for the last few values near the end of the buffer
    let mut result = 0u64;
    let mut remaining = bpv;
    let mut bo = byte_offset;
    let mut bs = bit_shift;
    let mut out_shift = 0;
    while remaining > 0 {
        let can_read = (8 - bs).min(remaining);
        let mask = ((1u64 << can_read) - 1) as u8;
        let byte = if bo < data.len() { data[bo] } else { 0 };
        result |= (((byte >> bs) & mask) as u64) << out_shift;
        remaining -= can_read;
        out_shift += can_read;
        bo += 1;
        bs = 0;
    }
    result
}

fn encode_chunk<T: IntValue>(values: &[T], out: &mut Vec<u8>) {
    let raw: Vec<u64> = values.iter().map(|v| v.to_u64()).collect();
    let bits = find_optimal_bit_width(&raw, T::BITS);

    let mut exceptions: Vec<(u8, u64)> = Vec::new();
    for (i, &v) in raw.iter().enumerate() {
        if bits_needed(v) > bits {
            exceptions.push((i as u8, v >> bits));
        }
    }

    out.push(bits);
    out.push(exceptions.len() as u8);
    if bits > 0 {
        pack_low_bits(&raw, bits, out);
    }
    for &(pos, high) in &exceptions {
        out.push(pos);
        put_vint(out, high);
    }
}

fn decode_chunk<T: IntValue>(bytes: &[u8], pos: &mut usize, out: &mut Vec<T>, count: usize) -> Result<()> {
    if *pos + 2 > bytes.len() {
        return Err(Error::Corruption("truncated codec chunk header".into()));
    }
    let bits = bytes[*pos];
    let num_exceptions = bytes[*pos + 1] as usize;
    *pos += 2;

    if bits > T::BITS || num_exceptions > count {
        return Err(Error::Corruption("impossible codec chunk header".into()));
    }

    let packed_len = (count * bits as usize).div_ceil(8);
    if *pos + packed_len > bytes.len() {
        return Err(Error::Corruption("truncated codec chunk payload".into()));
    }
    let packed = &bytes[*pos..*pos + packed_len];
    *pos += packed_len;

    let base = out.len();
    if bits == 0 {
        out.resize(base + count, T::default());
    } else {
        out.reserve(count);
        for i in 0..count {
            out.push(T::from_u64(read_low_bits(packed, bits, i)));
        }
    }

    for _ in 0..num_exceptions {
        let exc_pos = *bytes
            .get(*pos)
            .ok_or_else(|| Error::Corruption("truncated codec exception".into()))?
            as usize;
        *pos += 1;
        let high = take_vint(bytes, pos)?;
        if exc_pos >= count {
            return Err(Error::Corruption("codec exception out of range".into()));
        }
        let low = out[base + exc_pos].to_u64();
        out[base + exc_pos] = T::from_u64((high << bits) | low);
    }

    Ok(())
}

fn encode_stream<T: IntValue>(values: &[T], out: &mut Vec<u8>) {
    put_vint(out, values.len() as u64);
    for chunk in values.chunks(CODEC_BLOCK_SIZE) {
        encode_chunk(chunk, out);
    }
}

fn decode_stream<T: IntValue>(bytes: &[u8], out: &mut Vec<T>) -> Result<()> {
    out.clear();
    let mut pos = 0usize;
    let n = take_vint(bytes, &mut pos)? as usize;
    let mut remaining = n;
    while remaining > 0 {
        let count = remaining.min(CODEC_BLOCK_SIZE);
        decode_chunk(bytes, &mut pos, out, count)?;
        remaining -= count;
    }
    if pos != bytes.len() {
        return Err(Error::Corruption("trailing bytes after codec stream".into()));
    }
    Ok(())
}

// ── Codec interface ───────────────────────────────────────────────────────

/// Narrow interface to the integer codec: encode/decode whole streams.
/// Streams embed their value count; the byte length is tracked by the block
/// layout around them.
pub trait IntCodec: Send + Sync {
    fn encode32(&self, values: &[u32], out: &mut Vec<u8>);
    fn decode32(&self, bytes: &[u8], out: &mut Vec<u32>) -> Result<()>;
    fn encode64(&self, values: &[u64], out: &mut Vec<u8>);
    fn decode64(&self, bytes: &[u8], out: &mut Vec<u64>) -> Result<()>;
}

/// The patched frame-of-reference codec family, 128-value chunks.
struct Pfor128;

impl IntCodec for Pfor128 {
    fn encode32(&self, values: &[u32], out: &mut Vec<u8>) {
        encode_stream(values, out);
    }
    fn decode32(&self, bytes: &[u8], out: &mut Vec<u32>) -> Result<()> {
        decode_stream(bytes, out)
    }
    fn encode64(&self, values: &[u64], out: &mut Vec<u8>) {
        encode_stream(values, out);
    }
    fn decode64(&self, bytes: &[u8], out: &mut Vec<u64>) -> Result<()> {
        decode_stream(bytes, out)
    }
}

const KNOWN_CODECS: &[&str] = &["fastpfor128", "simdfastpfor128"];

/// Construct the codec pair named by the store settings.
pub fn create_int_codec(codec32: &str, codec64: &str) -> Result<Box<dyn IntCodec>> {
    for name in [codec32, codec64] {
        if !KNOWN_CODECS.contains(&name) {
            return Err(Error::UnknownCodec(name.to_string()));
        }
    }
    Ok(Box::new(Pfor128))
}

// ── Delta coding ──────────────────────────────────────────────────────────

/// Replace `values` with first differences (`d[0] = v[0]`).
pub fn delta_encode<T: IntValue>(values: &mut [T]) {
    for i in (1..values.len()).rev() {
        values[i] = T::from_u64(values[i].to_u64().wrapping_sub(values[i - 1].to_u64()));
    }
}

/// Undo [`delta_encode`] over a whole stream.
pub fn delta_decode<T: IntValue>(values: &mut [T]) {
    for i in 1..values.len() {
        values[i] = T::from_u64(values[i].to_u64().wrapping_add(values[i - 1].to_u64()));
    }
}

/// Undo per-row first differences. `offsets` holds `n + 1` cumulative value
/// positions; slice `i` is `values[offsets[i]..offsets[i + 1]]`. Each slice
/// is non-decreasing afterwards; the filter logic depends on that order.
pub fn apply_inverse_deltas<T: IntValue>(values: &mut [T], offsets: &[u32]) {
    for w in offsets.windows(2) {
        for i in w[0] as usize + 1..w[1] as usize {
            values[i] = T::from_u64(values[i].to_u64().wrapping_add(values[i - 1].to_u64()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip32(values: &[u32]) {
        let codec = create_int_codec("fastpfor128", "fastpfor128").unwrap();
        let mut bytes = Vec::new();
        codec.encode32(values, &mut bytes);
        let mut out = Vec::new();
        codec.decode32(&bytes, &mut out).unwrap();
        assert_eq!(out, values);
    }

    fn roundtrip64(values: &[u64]) {
        let codec = create_int_codec("simdfastpfor128", "fastpfor128").unwrap();
        let mut bytes = Vec::new();
        codec.encode64(values, &mut bytes);
        let mut out = Vec::new();
        codec.decode64(&bytes, &mut out).unwrap();
        assert_eq!(out, values);
    }

    #[test]
    fn test_pfor_empty() {
        roundtrip32(&[]);
        roundtrip64(&[]);
    }

    #[test]
    fn test_pfor_small() {
        roundtrip32(&[0, 1, 2, 3, 42]);
        roundtrip64(&[u64::MAX, 0, 17]);
    }

    #[test]
    fn test_pfor_with_outliers() {
        let mut values: Vec<u32> = (0..100).map(|i| i % 16).collect();
        values[13] = 1_000_000;
        values[77] = u32::MAX;
        roundtrip32(&values);
    }

    #[test]
    fn test_pfor_multiple_chunks() {
        let values: Vec<u32> = (0..1000).map(|i| i * 37 % 8192).collect();
        roundtrip32(&values);

        let values: Vec<u64> = (0..300).map(|i| (i as u64) << 40).collect();
        roundtrip64(&values);
    }

    #[test]
    fn test_pfor_all_zero() {
        roundtrip32(&vec![0u32; 500]);
    }

    #[test]
    fn test_unknown_codec_name() {
        assert!(create_int_codec("zstd", "fastpfor128").is_err());
        assert!(create_int_codec("fastpfor128", "varint").is_err());
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let codec = create_int_codec("fastpfor128", "fastpfor128").unwrap();
        let values: Vec<u32> = (0..200).collect();
        let mut bytes = Vec::new();
        codec.encode32(&values, &mut bytes);
        bytes.truncate(bytes.len() - 3);
        let mut out = Vec::new();
        assert!(codec.decode32(&bytes, &mut out).is_err());
    }

    #[test]
    fn test_bitpack_slots_widths() {
        for bits in [0u8, 1, 2, 3, 7, 8, 9, 16, 31, 32] {
            let mask = if bits == 0 {
                0
            } else if bits == 32 {
                u32::MAX
            } else {
                (1u32 << bits) - 1
            };
            let values: Vec<u32> = (0..128u32).map(|i| i.wrapping_mul(2654435761) & mask).collect();
            let mut words = vec![0u32; packed_word_count(128, bits)];
            bitpack_slots(&values, bits, &mut words);
            let mut out = vec![0u32; 128];
            bitunpack_slots(&words, bits, &mut out);
            assert_eq!(out, values, "bits={bits}");
        }
    }

    #[test]
    fn test_bitpack_short_input_pads_with_zero() {
        let values = [5u32, 6, 7];
        let mut words = vec![0u32; packed_word_count(128, 3)];
        bitpack_slots(&values, 3, &mut words);
        let mut out = vec![0u32; 128];
        bitunpack_slots(&words, 3, &mut out);
        assert_eq!(&out[..3], &values);
        assert!(out[3..].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_delta_roundtrip() {
        let mut values: Vec<u32> = vec![3, 7, 7, 10, 100];
        let original = values.clone();
        delta_encode(&mut values);
        assert_eq!(values, vec![3, 4, 0, 3, 90]);
        delta_decode(&mut values);
        assert_eq!(values, original);
    }

    #[test]
    fn test_apply_inverse_deltas_slices() {
        // Two rows [1, 4, 9] and [5, 5] stored as first differences.
        let mut values: Vec<u32> = vec![1, 3, 5, 5, 0];
        let offsets = vec![0u32, 3, 5];
        apply_inverse_deltas(&mut values, &offsets);
        assert_eq!(values, vec![1, 4, 9, 5, 5]);
        for w in offsets.windows(2) {
            let slice = &values[w[0] as usize..w[1] as usize];
            assert!(slice.windows(2).all(|p| p[0] <= p[1]));
        }
    }

    #[test]
    fn test_vint_roundtrip() {
        for v in [0u64, 1, 127, 128, 16383, 16384, u64::MAX] {
            let mut buf = Vec::new();
            put_vint(&mut buf, v);
            let mut pos = 0;
            assert_eq!(take_vint(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }
}
