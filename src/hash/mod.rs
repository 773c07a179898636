//! Directory-name hash registry.
//!
//! A directory entry's key offset is `hash(name) & 0x7fffff80` plus a 7-bit
//! generation counter.  The superblock records which function the tree was
//! built with as a small integer code; the same code travels in the high byte
//! of every leaf record tag so the unpacker can recompute entry offsets.
//!
//! All three functions operate on the name as signed chars, matching the
//! kernel implementation byte for byte.

/// Bits of an entry offset that hold the hash value.
pub const HASH_VALUE_MASK: u32 = 0x7fff_ff80;
/// Bits of an entry offset that hold the generation counter.
pub const GENERATION_MASK: u32 = 0x7f;
/// Smallest hash value; a name hashing to 0 is moved here.
pub const MIN_HASH_VALUE: u32 = 128;

pub const DOT_OFFSET:     u32 = 1;
pub const DOT_DOT_OFFSET: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashCode {
    Unset,
    Tea,
    Yura,
    R5,
}

impl HashCode {
    pub fn code(self) -> u8 {
        match self {
            HashCode::Unset => 0,
            HashCode::Tea   => 1,
            HashCode::Yura  => 2,
            HashCode::R5    => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(HashCode::Unset),
            1 => Some(HashCode::Tea),
            2 => Some(HashCode::Yura),
            3 => Some(HashCode::R5),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashCode::Unset => "unset",
            HashCode::Tea   => "tea",
            HashCode::Yura  => "rupasov",
            HashCode::R5    => "r5",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tea"             => Some(HashCode::Tea),
            "rupasov" | "yura" => Some(HashCode::Yura),
            "r5"              => Some(HashCode::R5),
            _                 => None,
        }
    }

    /// The raw hash function, or `None` when the filesystem never chose one.
    pub fn function(self) -> Option<fn(&[u8]) -> u32> {
        match self {
            HashCode::Unset => None,
            HashCode::Tea   => Some(tea_hash),
            HashCode::Yura  => Some(yura_hash),
            HashCode::R5    => Some(r5_hash),
        }
    }

    /// The 31-bit entry offset for `name` with generation counter `gen`.
    /// `name` must already have its zero padding stripped.
    pub fn entry_offset(self, name: &[u8], gen: u32) -> Option<u32> {
        match name {
            b"."  => return Some(DOT_OFFSET),
            b".." => return Some(DOT_DOT_OFFSET),
            _ => {}
        }
        let f = self.function()?;
        let mut value = f(name) & HASH_VALUE_MASK;
        if value == 0 {
            value = MIN_HASH_VALUE;
        }
        Some(value + (gen & GENERATION_MASK))
    }
}

/// Strip the zero padding that format-2 directories add after each name.
pub fn trim_name(slot: &[u8]) -> &[u8] {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    &slot[..end]
}

// ── Hash functions ───────────────────────────────────────────────────────────

#[inline]
fn sc(b: u8) -> u32 {
    b as i8 as i32 as u32
}

pub fn r5_hash(name: &[u8]) -> u32 {
    let mut a: u32 = 0;
    for &b in name.iter().take_while(|&&b| b != 0) {
        let c = b as i8 as i32;
        a = a.wrapping_add((c << 4) as u32);
        a = a.wrapping_add((c >> 4) as u32);
        a = a.wrapping_mul(11);
    }
    a
}

pub fn yura_hash(name: &[u8]) -> u32 {
    let len = name.len();
    let pow_from = |i: usize| -> u32 {
        let mut pow: u32 = 1;
        let mut j = i;
        while j + 1 < len {
            pow = pow.wrapping_mul(10);
            j += 1;
        }
        pow
    };

    let mut pow: u32 = 1;
    for _ in 1..len {
        pow = pow.wrapping_mul(10);
    }
    let first = sc(name.first().copied().unwrap_or(b'0')).wrapping_sub(48);
    let mut a = if len == 1 { first } else { first.wrapping_mul(pow) };

    let mut i = 1;
    while i < len {
        let c = sc(name[i]).wrapping_sub(48);
        a = a.wrapping_add(c.wrapping_mul(pow_from(i)));
        i += 1;
    }
    // Padding digits up to 40 contribute '0' - 48 == 0.
    i = i.max(40);
    while i < 256 {
        a = a.wrapping_add((i as u32).wrapping_mul(pow_from(i)));
        i += 1;
    }
    a << 7
}

const TEA_DELTA: u32 = 0x9e37_79b9;
const TEA_FULLROUNDS: u32 = 10;
const TEA_PARTROUNDS: u32 = 6;

fn tea_core(h: &mut [u32; 2], k: [u32; 4], rounds: u32) {
    let [a, b, c, d] = k;
    let (mut b0, mut b1) = (h[0], h[1]);
    let mut sum: u32 = 0;
    for _ in 0..rounds {
        sum = sum.wrapping_add(TEA_DELTA);
        b0 = b0.wrapping_add(
            (b1 << 4).wrapping_add(a) ^ b1.wrapping_add(sum) ^ (b1 >> 5).wrapping_add(b),
        );
        b1 = b1.wrapping_add(
            (b0 << 4).wrapping_add(c) ^ b0.wrapping_add(sum) ^ (b0 >> 5).wrapping_add(d),
        );
    }
    h[0] = h[0].wrapping_add(b0);
    h[1] = h[1].wrapping_add(b1);
}

pub fn tea_hash(name: &[u8]) -> u32 {
    let word = |m: &[u8], at: usize| -> u32 {
        sc(m[at]) | sc(m[at + 1]) << 8 | sc(m[at + 2]) << 16 | sc(m[at + 3]) << 24
    };
    let mut h = [0x9464_a485u32, 0x542e_1a94];

    let len = name.len() as u32;
    let mut pad = len | (len << 8);
    pad |= pad << 16;

    let mut msg = name;
    while msg.len() >= 16 {
        let k = [word(msg, 0), word(msg, 4), word(msg, 8), word(msg, 12)];
        tea_core(&mut h, k, TEA_PARTROUNDS);
        msg = &msg[16..];
    }

    let fold = |mut acc: u32, tail: &[u8]| -> u32 {
        for &b in tail {
            acc = (acc << 8) | sc(b);
        }
        acc
    };
    let k = match msg.len() {
        12.. => [word(msg, 0), word(msg, 4), word(msg, 8), fold(pad, &msg[12..])],
        8..  => [word(msg, 0), word(msg, 4), fold(pad, &msg[8..]), pad],
        4..  => [word(msg, 0), fold(pad, &msg[4..]), pad, pad],
        _    => [fold(pad, msg), pad, pad, pad],
    };
    tea_core(&mut h, k, TEA_FULLROUNDS);
    h[0] ^ h[1]
}
