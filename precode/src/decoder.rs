use binout::{AsIs, Serializer, VByte};
use dyn_size_of::GetSize;
use std::io;

use crate::n_lowest_bits_0_64;

/// Canonical tree tables shared by the Huffman decoders:
/// values in canonical order (most frequent first) and the number of
/// internal nodes of each level (root not counted, last entry zero).
#[derive(Clone)]
pub struct Tree {
    pub(crate) values: Box<[u64]>,
    pub(crate) internal_counts: Box<[u32]>,
}

impl Tree {
    /// Returns the leaf sequence number and codeword length of the leading codeword
    /// of `window`, walking one level per window bit.
    #[inline] pub fn leaf_of(&self, window: u64) -> Option<(u32, u8)> {
        let mut shift = 0u32;
        let mut first_leaf = 0u32;
        let mut level_size = 2u32;
        for level in 0..self.internal_counts.len().min(64) {
            shift += ((window >> level) & 1) as u32;
            let internal = self.internal_counts[level];
            if shift < internal {   // internal node, go one level down
                shift <<= 1;
                first_leaf += level_size - internal;
                level_size = internal << 1;
            } else {
                return Some((first_leaf + shift - internal, level as u8 + 1));
            }
        }
        None
    }

    /// Returns the codeword length of the leaf with the given sequence number.
    pub(crate) fn depth_of_leaf(&self, leaf: u32) -> u8 {
        let mut level_size = 2u32;
        let mut first = 0u32;
        for level in 0..self.internal_counts.len() as u8 {
            let internal = self.internal_counts[level as usize];
            let leaves = level_size - internal;
            if leaf < first + leaves { return level + 1; }
            first += leaves;
            level_size = internal << 1;
        }
        self.internal_counts.len() as u8
    }
}

/// Decoder of the leading codeword of a 64-bit window.
///
/// Windows are consumed from bit 0 upwards; the decoder returns the decoded
/// value together with the codeword length in bits, or [`None`] if the
/// window does not start with a valid codeword.
#[derive(Clone)]
pub enum Decoder {
    /// `v` ones followed by a zero.
    Unary { max_len: u8 },
    /// Fixed-width binary, lowest bit first.
    Binary { width: u8 },
    /// Elias gamma over `v+1`, zero run first, then the binary part highest bit first.
    Gamma { max_len: u8 },
    /// Canonical Huffman.
    Huffman(Tree),
    /// Canonical Huffman with an escape leaf: after the escape codeword the
    /// value itself follows, raw, on `esc_width` bits.
    Limited { tree: Tree, esc_index: u32, esc_width: u8 },
}

impl Decoder {
    /// Decodes the leading codeword of `window`.
    pub fn decode(&self, window: u64) -> Option<(u64, u8)> {
        match self {
            Decoder::Unary { max_len } => {
                let len = (!window).trailing_zeros() as u8 + 1;
                (len <= *max_len).then(|| (len as u64 - 1, len))
            }
            Decoder::Binary { width } => {
                Some((window & n_lowest_bits_0_64(*width), *width))
            }
            Decoder::Gamma { max_len } => {
                let z = window.trailing_zeros() as u8;
                let len = 2*z + 1;
                if z >= 32 || len > *max_len { return None; }
                let n = rev_bits((window >> z) & n_lowest_bits_0_64(z+1), z+1);
                Some((n - 1, len))
            }
            Decoder::Huffman(tree) => {
                let (leaf, len) = tree.leaf_of(window)?;
                tree.values.get(leaf as usize).map(|v| (*v, len))
            }
            Decoder::Limited { tree, esc_index, esc_width } => {
                let (leaf, len) = tree.leaf_of(window)?;
                if leaf == *esc_index {
                    (len + esc_width <= 64).then(||
                        ((window >> len) & n_lowest_bits_0_64(*esc_width), len + esc_width))
                } else {
                    let leaf = if leaf > *esc_index { leaf - 1 } else { leaf };
                    tree.values.get(leaf as usize).map(|v| (*v, len))
                }
            }
        }
    }

    /// Returns the length of the longest codeword, in bits.
    pub fn max_codeword_length(&self) -> u8 {
        match self {
            Decoder::Unary { max_len } => *max_len,
            Decoder::Binary { width } => *width,
            Decoder::Gamma { max_len } => *max_len,
            Decoder::Huffman(tree) => tree.internal_counts.len() as u8,
            Decoder::Limited { tree, esc_index, esc_width } =>
                (tree.internal_counts.len() as u8).max(tree.depth_of_leaf(*esc_index) + esc_width),
        }
    }

    /// Returns number of bytes which `write` will write.
    pub fn write_bytes(&self) -> usize {
        AsIs::size(0u8) + match self {
            Decoder::Unary{..} | Decoder::Binary{..} | Decoder::Gamma{..} => AsIs::size(0u8),
            Decoder::Huffman(tree) => tree_write_bytes(tree),
            Decoder::Limited { tree, esc_index, .. } =>
                tree_write_bytes(tree) + VByte::size(*esc_index) + AsIs::size(0u8),
        }
    }

    /// Writes `self` to the `output`.
    pub fn write(&self, output: &mut dyn io::Write) -> io::Result<()> {
        match self {
            Decoder::Unary { max_len } => { AsIs::write(output, 0u8)?; AsIs::write(output, *max_len) }
            Decoder::Binary { width } => { AsIs::write(output, 1u8)?; AsIs::write(output, *width) }
            Decoder::Gamma { max_len } => { AsIs::write(output, 2u8)?; AsIs::write(output, *max_len) }
            Decoder::Huffman(tree) => { AsIs::write(output, 3u8)?; tree_write(tree, output) }
            Decoder::Limited { tree, esc_index, esc_width } => {
                AsIs::write(output, 4u8)?;
                tree_write(tree, output)?;
                VByte::write(output, *esc_index)?;
                AsIs::write(output, *esc_width)
            }
        }
    }

    /// Reads `Self` from the `input`.
    pub fn read(input: &mut dyn io::Read) -> io::Result<Self> {
        let tag: u8 = AsIs::read(input)?;
        Ok(match tag {
            0 => Decoder::Unary { max_len: AsIs::read(input)? },
            1 => Decoder::Binary { width: AsIs::read(input)? },
            2 => Decoder::Gamma { max_len: AsIs::read(input)? },
            3 => Decoder::Huffman(tree_read(input)?),
            4 => Decoder::Limited {
                tree: tree_read(input)?,
                esc_index: VByte::read(input)?,
                esc_width: AsIs::read(input)?,
            },
            _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown decoder tag")),
        })
    }
}

impl GetSize for Decoder {
    fn size_bytes_dyn(&self) -> usize {
        match self {
            Decoder::Huffman(tree) | Decoder::Limited { tree, .. } =>
                tree.values.size_bytes_dyn() + tree.internal_counts.size_bytes_dyn(),
            _ => 0,
        }
    }
    const USES_DYN_MEM: bool = true;
}

fn tree_write_bytes(tree: &Tree) -> usize {
    VByte::array_size(&tree.internal_counts) + AsIs::array_size(&tree.values)
}

fn tree_write(tree: &Tree, output: &mut dyn io::Write) -> io::Result<()> {
    VByte::write_array(output, &tree.internal_counts)?;
    AsIs::write_array(output, &tree.values)
}

fn tree_read(input: &mut dyn io::Read) -> io::Result<Tree> {
    Ok(Tree {
        internal_counts: VByte::read_array(input)?,
        values: AsIs::read_array(input)?,
    })
}

/// Reverses the lowest `n` bits of `v`. `n` must be in range [1, 64].
#[inline(always)] pub(crate) fn rev_bits(v: u64, n: u8) -> u64 {
    v.reverse_bits() >> (64 - n)
}
