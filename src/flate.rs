//! Native zlib stream encoder for `/FlateDecode` PDF streams.
//!
//! Input is split into independent chunks whose LZ77 token plans are computed
//! on the rayon pool; the bit-level fixed-Huffman encode and the Adler-32
//! checksum merge stay deterministic regardless of worker count.

use rayon::prelude::*;

const ADLER_BASE: u32 = 65_521;
const ADLER_CHUNK: usize = 1 << 20;

const LZ77_CHUNK_BYTES: usize = 64 * 1024;
const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 258;
const MAX_DISTANCE: usize = 32 * 1024;
const MAX_CHAIN_STEPS: usize = 64;
const HASH_BITS: usize = 15;
const HASH_SIZE: usize = 1 << HASH_BITS;

const LENGTH_BASE: [usize; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];

const LENGTH_EXTRA_BITS: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];

const DIST_BASE: [usize; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];

const DIST_EXTRA_BITS: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];

#[derive(Clone, Copy, Debug)]
struct AdlerPart {
    a: u32,
    b: u32,
    len: usize,
}

impl AdlerPart {
    fn identity() -> Self {
        Self { a: 1, b: 0, len: 0 }
    }

    fn of(data: &[u8]) -> Self {
        let mut a: u32 = 1;
        let mut b: u32 = 0;
        for &byte in data {
            a += byte as u32;
            if a >= ADLER_BASE {
                a -= ADLER_BASE;
            }
            b += a;
            b %= ADLER_BASE;
        }
        Self {
            a,
            b,
            len: data.len(),
        }
    }

    fn combine(self, rhs: Self) -> Self {
        if self.len == 0 {
            return rhs;
        }
        if rhs.len == 0 {
            return self;
        }
        let a = (self.a + rhs.a + ADLER_BASE - 1) % ADLER_BASE;
        let b = (self.b as u64
            + rhs.b as u64
            + ((rhs.len as u64 % ADLER_BASE as u64) * ((self.a + ADLER_BASE - 1) as u64)))
            % ADLER_BASE as u64;
        Self {
            a,
            b: b as u32,
            len: self.len + rhs.len,
        }
    }

    fn value(self) -> u32 {
        (self.b << 16) | self.a
    }
}

#[derive(Clone, Copy, Debug)]
enum Token {
    Literal(u8),
    Match { len: u16, dist: u16 },
}

#[derive(Default)]
struct BitWriter {
    out: Vec<u8>,
    bit_buf: u64,
    bit_count: u8,
}

impl BitWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            out: Vec::with_capacity(capacity),
            bit_buf: 0,
            bit_count: 0,
        }
    }

    fn write_bits(&mut self, bits: u32, count: u8) {
        if count == 0 {
            return;
        }
        self.bit_buf |= (bits as u64) << self.bit_count;
        self.bit_count += count;
        while self.bit_count >= 8 {
            self.out.push((self.bit_buf & 0xFF) as u8);
            self.bit_buf >>= 8;
            self.bit_count -= 8;
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bit_count > 0 {
            self.out.push((self.bit_buf & 0xFF) as u8);
        }
        self.out
    }
}

fn chunk_ranges(total_len: usize, chunk_size: usize) -> Vec<(usize, usize)> {
    if total_len == 0 {
        return vec![(0, 0)];
    }
    let chunk_size = chunk_size.max(1);
    let mut out = Vec::with_capacity(total_len.div_ceil(chunk_size));
    let mut start = 0usize;
    while start < total_len {
        let end = (start + chunk_size).min(total_len);
        out.push((start, end));
        start = end;
    }
    out
}

fn adler32(data: &[u8]) -> u32 {
    let ranges = chunk_ranges(data.len(), ADLER_CHUNK);
    ranges
        .par_iter()
        .map(|(start, end)| AdlerPart::of(&data[*start..*end]))
        .collect::<Vec<_>>()
        .into_iter()
        .fold(AdlerPart::identity(), AdlerPart::combine)
        .value()
}

fn hash3(data: &[u8], i: usize) -> usize {
    let v = ((data[i] as u32) << 16) ^ ((data[i + 1] as u32) << 8) ^ (data[i + 2] as u32);
    (v.wrapping_mul(0x1E35_A7BD) >> (32 - HASH_BITS)) as usize
}

fn match_len(data: &[u8], a: usize, b: usize, max_len: usize) -> usize {
    let mut l = 0usize;
    while l < max_len && data[a + l] == data[b + l] {
        l += 1;
    }
    l
}

/// Greedy hash-chain matcher over one chunk. Matches never cross chunk
/// boundaries, which is what makes the per-chunk planning independent.
fn plan_chunk(data: &[u8]) -> Vec<Token> {
    let n = data.len();
    if n == 0 {
        return Vec::new();
    }

    let mut head = vec![-1_i32; HASH_SIZE];
    let mut prev = vec![-1_i32; n];
    let mut tokens = Vec::with_capacity(n / 2);

    let mut i = 0usize;
    while i < n {
        if i + MIN_MATCH > n {
            tokens.push(Token::Literal(data[i]));
            i += 1;
            continue;
        }

        let h = hash3(data, i);
        let mut cand = head[h];
        prev[i] = cand;
        head[h] = i as i32;

        let mut best_len = 0usize;
        let mut best_dist = 0usize;
        let mut steps = 0usize;

        while cand >= 0 && steps < MAX_CHAIN_STEPS {
            let c = cand as usize;
            let dist = i - c;
            if dist > MAX_DISTANCE {
                break;
            }

            if data[c] == data[i] && data[c + 1] == data[i + 1] && data[c + 2] == data[i + 2] {
                let max_len = MAX_MATCH.min(n - i);
                let len = match_len(data, c, i, max_len);
                if len >= MIN_MATCH && (len > best_len || (len == best_len && dist < best_dist)) {
                    best_len = len;
                    best_dist = dist;
                    if best_len == MAX_MATCH {
                        break;
                    }
                }
            }

            cand = prev[c];
            steps += 1;
        }

        if best_len >= MIN_MATCH {
            tokens.push(Token::Match {
                len: best_len as u16,
                dist: best_dist as u16,
            });

            let end = (i + best_len).min(n);
            let mut j = i + 1;
            while j < end {
                if j + MIN_MATCH <= n {
                    let hj = hash3(data, j);
                    prev[j] = head[hj];
                    head[hj] = j as i32;
                }
                j += 1;
            }

            i += best_len;
        } else {
            tokens.push(Token::Literal(data[i]));
            i += 1;
        }
    }

    tokens
}

fn reverse_bits(mut value: u16, len: u8) -> u16 {
    let mut out = 0u16;
    for _ in 0..len {
        out = (out << 1) | (value & 1);
        value >>= 1;
    }
    out
}

fn fixed_litlen_code(sym: u16) -> (u16, u8) {
    match sym {
        0..=143 => (0x30 + sym, 8),
        144..=255 => (0x190 + (sym - 144), 9),
        256..=279 => (sym - 256, 7),
        280..=287 => (0x0C0 + (sym - 280), 8),
        _ => (0, 0),
    }
}

fn write_litlen(bw: &mut BitWriter, sym: u16) {
    let (code, len) = fixed_litlen_code(sym);
    bw.write_bits(reverse_bits(code, len) as u32, len);
}

fn length_to_symbol(len: usize) -> (u16, u8, u16) {
    for (idx, (&base, &extra)) in LENGTH_BASE.iter().zip(LENGTH_EXTRA_BITS.iter()).enumerate() {
        let max = if extra == 0 {
            base
        } else {
            base + ((1usize << extra) - 1)
        };
        if len <= max {
            return (257 + idx as u16, extra, (len - base) as u16);
        }
    }
    (285, 0, 0)
}

fn dist_to_symbol(dist: usize) -> (u16, u8, u16) {
    for (idx, (&base, &extra)) in DIST_BASE.iter().zip(DIST_EXTRA_BITS.iter()).enumerate() {
        let max = if extra == 0 {
            base
        } else {
            base + ((1usize << extra) - 1)
        };
        if dist <= max {
            return (idx as u16, extra, (dist - base) as u16);
        }
    }
    (0, 0, 0)
}

fn encode_chunk(bw: &mut BitWriter, tokens: &[Token], final_block: bool) {
    // BFINAL + BTYPE(01 = fixed Huffman), packed LSB-first.
    let header = (if final_block { 1u32 } else { 0u32 }) | (0b01 << 1);
    bw.write_bits(header, 3);

    for token in tokens {
        match *token {
            Token::Literal(byte) => write_litlen(bw, byte as u16),
            Token::Match { len, dist } => {
                let (len_sym, len_extra_bits, len_extra_val) = length_to_symbol(len as usize);
                write_litlen(bw, len_sym);
                if len_extra_bits > 0 {
                    bw.write_bits(len_extra_val as u32, len_extra_bits);
                }

                let (dist_sym, dist_extra_bits, dist_extra_val) = dist_to_symbol(dist as usize);
                bw.write_bits(reverse_bits(dist_sym, 5) as u32, 5);
                if dist_extra_bits > 0 {
                    bw.write_bits(dist_extra_val as u32, dist_extra_bits);
                }
            }
        }
    }

    // End-of-block.
    write_litlen(bw, 256);
}

/// Compresses `data` into a complete zlib stream suitable for a
/// `/FlateDecode` PDF stream body.
pub(crate) fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let ranges = chunk_ranges(data.len(), LZ77_CHUNK_BYTES);
    let plans: Vec<Vec<Token>> = ranges
        .par_iter()
        .map(|(start, end)| plan_chunk(&data[*start..*end]))
        .collect();

    let adler = adler32(data);

    // Fixed Huffman can expand worst-case input by a little under 2x.
    let mut bw = BitWriter::with_capacity(2 + data.len() + data.len() / 2 + 64);
    // CMF = 0x78 (deflate, 32K window), FLG chosen for a valid FCHECK.
    bw.out.extend_from_slice(&[0x78, 0x01]);

    for (idx, plan) in plans.iter().enumerate() {
        encode_chunk(&mut bw, plan, idx + 1 == plans.len());
    }

    let mut out = bw.finish();
    out.extend_from_slice(&adler.to_be_bytes());
    out
}
