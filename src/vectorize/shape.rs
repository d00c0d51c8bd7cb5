use crate::bail;
use crate::error::{Lc, LcCode, Stage};
use std::fmt;

// Per-value vectorization shape. Ordered Undef < Uniform < Contiguous <
// Strided < Varying; two strided shapes with different strides only meet in
// Varying. Stride 0 collapses to Uniform, stride 1 to Contiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorShape {
    Undef,
    Uniform { align: u64 },
    Contiguous { align: u64 },
    Strided { stride: i64, align: u64 },
    Varying { align: u64 },
}

impl VectorShape {
    pub fn undef() -> Self {
        Self::Undef
    }

    pub fn uni() -> Self {
        Self::Uniform { align: 1 }
    }

    pub fn cont() -> Self {
        Self::Contiguous { align: 1 }
    }

    pub fn strided(stride: i64) -> Self {
        match stride {
            0 => Self::Uniform { align: 1 },
            1 => Self::Contiguous { align: 1 },
            s => Self::Strided { stride: s, align: 1 },
        }
    }

    pub fn varying() -> Self {
        Self::Varying { align: 1 }
    }

    pub fn with_alignment(self, align: u64) -> Self {
        debug_assert!(align > 0);
        match self {
            Self::Undef => Self::Undef,
            Self::Uniform { .. } => Self::Uniform { align },
            Self::Contiguous { .. } => Self::Contiguous { align },
            Self::Strided { stride, .. } => Self::Strided { stride, align },
            Self::Varying { .. } => Self::Varying { align },
        }
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self, Self::Undef)
    }

    pub fn is_uniform(&self) -> bool {
        matches!(self, Self::Uniform { .. })
    }

    pub fn has_stride(&self) -> bool {
        matches!(
            self,
            Self::Uniform { .. } | Self::Contiguous { .. } | Self::Strided { .. }
        )
    }

    pub fn alignment(&self) -> u64 {
        match self {
            Self::Undef => 1,
            Self::Uniform { align }
            | Self::Contiguous { align }
            | Self::Strided { align, .. }
            | Self::Varying { align } => *align,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Undef => 0,
            Self::Uniform { .. } => 1,
            Self::Contiguous { .. } => 2,
            Self::Strided { .. } => 3,
            Self::Varying { .. } => 4,
        }
    }

    // Least upper bound. Alignments meet by gcd.
    pub fn join(self, other: Self) -> Self {
        match (self, other) {
            (Self::Undef, s) | (s, Self::Undef) => s,
            (a, b) => {
                let align = gcd(a.alignment(), b.alignment());
                if a.rank() == b.rank() {
                    if let (Self::Strided { stride: s1, .. }, Self::Strided { stride: s2, .. }) =
                        (a, b)
                    {
                        if s1 != s2 {
                            return Self::Varying { align };
                        }
                    }
                    a.with_alignment(align)
                } else if a.rank() > b.rank() {
                    a.with_alignment(align)
                } else {
                    b.with_alignment(align)
                }
            }
        }
    }
}

impl fmt::Display for VectorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undef => write!(f, "undef"),
            Self::Uniform { align } => write!(f, "uni(a{})", align),
            Self::Contiguous { align } => write!(f, "cont(a{})", align),
            Self::Strided { stride, align } => write!(f, "stride({}, a{})", stride, align),
            Self::Varying { align } => write!(f, "varying(a{})", align),
        }
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

// Shape string codec for drivers and tests:
//   shapes   := shape ( '_' shape )* ( 'r' shape )?
//   shape    := 'B' | ( 'U' | 'C' | 'T' | ( 'S' digit+ ) ) alignOpt
//   alignOpt := ( 'a' digit+ )?
pub fn decode_shapes(input: &str) -> Lc<(Vec<VectorShape>, Option<VectorShape>)> {
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0usize;
    let mut args = Vec::new();

    args.push(decode_one(&chars, &mut pos, input)?);
    let mut result = None;
    while pos < chars.len() {
        match chars[pos] {
            '_' => {
                pos += 1;
                args.push(decode_one(&chars, &mut pos, input)?);
            }
            'r' => {
                pos += 1;
                result = Some(decode_one(&chars, &mut pos, input)?);
                if pos < chars.len() {
                    bail!(
                        "lanec.Shape",
                        LcCode::E0101,
                        Stage::Shape,
                        "trailing input after result shape in '{}' at {}",
                        input,
                        pos
                    );
                }
            }
            c => {
                bail!(
                    "lanec.Shape",
                    LcCode::E0101,
                    Stage::Shape,
                    "expected '_' or 'r' in '{}' at {}, found '{}'",
                    input,
                    pos,
                    c
                );
            }
        }
    }

    Ok((args, result))
}

pub fn decode_shape(input: &str) -> Lc<VectorShape> {
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0usize;
    let shape = decode_one(&chars, &mut pos, input)?;
    if pos != chars.len() {
        bail!(
            "lanec.Shape",
            LcCode::E0101,
            Stage::Shape,
            "trailing input in shape '{}' at {}",
            input,
            pos
        );
    }
    Ok(shape)
}

fn decode_one(chars: &[char], pos: &mut usize, input: &str) -> Lc<VectorShape> {
    let c = match chars.get(*pos) {
        Some(c) => *c,
        None => {
            bail!(
                "lanec.Shape",
                LcCode::E0101,
                Stage::Shape,
                "unexpected end of shape string '{}'",
                input
            );
        }
    };
    *pos += 1;

    let base = match c {
        'B' => return Ok(VectorShape::Undef),
        'U' => VectorShape::uni(),
        'C' => VectorShape::cont(),
        'T' => VectorShape::varying(),
        'S' => {
            let stride = decode_digits(chars, pos, input)?;
            VectorShape::strided(stride)
        }
        _ => {
            bail!(
                "lanec.Shape",
                LcCode::E0101,
                Stage::Shape,
                "unknown shape letter '{}' in '{}' at {}",
                c,
                input,
                *pos - 1
            );
        }
    };

    if chars.get(*pos) == Some(&'a') {
        *pos += 1;
        let align = decode_digits(chars, pos, input)?;
        if align <= 0 {
            bail!(
                "lanec.Shape",
                LcCode::E0101,
                Stage::Shape,
                "alignment must be positive in '{}'",
                input
            );
        }
        return Ok(base.with_alignment(align as u64));
    }
    Ok(base)
}

fn decode_digits(chars: &[char], pos: &mut usize, input: &str) -> Lc<i64> {
    let start = *pos;
    if chars.get(*pos) == Some(&'-') {
        *pos += 1;
    }
    let digits_start = *pos;
    while chars.get(*pos).map(|c| c.is_ascii_digit()).unwrap_or(false) {
        *pos += 1;
    }
    if digits_start == *pos {
        bail!(
            "lanec.Shape",
            LcCode::E0101,
            Stage::Shape,
            "expected digits in '{}' at {}",
            input,
            start
        );
    }
    let text: String = chars[start..*pos].iter().collect();
    match text.parse::<i64>() {
        Ok(n) => Ok(n),
        Err(_) => {
            bail!(
                "lanec.Shape",
                LcCode::E0101,
                Stage::Shape,
                "number out of range in '{}' at {}",
                input,
                start
            );
        }
    }
}

pub fn encode_shape(shape: VectorShape) -> String {
    let (letter, align) = match shape {
        VectorShape::Undef => return "B".to_string(),
        VectorShape::Uniform { align } => ("U".to_string(), align),
        VectorShape::Contiguous { align } => ("C".to_string(), align),
        VectorShape::Strided { stride, align } => (format!("S{}", stride), align),
        VectorShape::Varying { align } => ("T".to_string(), align),
    };
    if align != 1 {
        format!("{}a{}", letter, align)
    } else {
        letter
    }
}

pub fn encode_shapes(args: &[VectorShape], result: Option<VectorShape>) -> String {
    let mut out = args
        .iter()
        .map(|&s| encode_shape(s))
        .collect::<Vec<_>>()
        .join("_");
    if let Some(r) = result {
        out.push('r');
        out.push_str(&encode_shape(r));
    }
    out
}
