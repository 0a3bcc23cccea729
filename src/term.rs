use crate::InferenceError;
use crate::atom_table::AtomTable;
use smallvec::SmallVec;

const FLAG_SQUARED: u8 = 0b01;
const FLAG_HINGE: u8 = 0b10;

/// Atoms per term; the record stores the count as a u16.
pub const MAX_TERM_SIZE: usize = u16::MAX as usize;

/// Little-endian cursor over a decoded page body.
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], InferenceError> {
        if self.remaining() < N {
            return Err(InferenceError::Other(format!(
                "Corrupt term record: needed {} bytes at offset {}, {} left",
                N,
                self.pos,
                self.remaining()
            )));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, InferenceError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, InferenceError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, InferenceError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, InferenceError> {
        Ok(f32::from_le_bytes(self.take()?))
    }
}

/// One ground rule instance: `weight * loss(sum(coefficients[i] * atoms[i]) - constant)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectiveTerm {
    pub weight: f32,
    pub constant: f32,
    pub squared: bool,
    pub hinge: bool,
    pub coefficients: SmallVec<[f32; 4]>,
    pub atoms: SmallVec<[u32; 4]>,
}

impl ObjectiveTerm {
    pub fn new(weight: f32, constant: f32, squared: bool, hinge: bool, terms: &[(f32, u32)]) -> Self {
        ObjectiveTerm {
            weight,
            constant,
            squared,
            hinge,
            coefficients: terms.iter().map(|(c, _)| *c).collect(),
            atoms: terms.iter().map(|(_, a)| *a).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.atoms.len()
    }

    pub fn encoded_len(&self) -> usize {
        1 + 4 + 4 + 2 + self.size() * 8
    }

    /// `sum(c_i * x_i) - constant` against the live atom values.
    pub fn dot(&self, atoms: &AtomTable) -> f32 {
        self.coefficients
            .iter()
            .zip(self.atoms.iter())
            .map(|(c, slot)| c * atoms.value(*slot))
            .sum::<f32>()
            - self.constant
    }

    pub fn evaluate(&self, atoms: &AtomTable) -> f32 {
        let mut dot = self.dot(atoms);
        if self.hinge {
            dot = dot.max(0.0);
        }
        if self.squared {
            self.weight * dot * dot
        } else {
            self.weight * dot
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        let mut flags = 0u8;
        if self.squared {
            flags |= FLAG_SQUARED;
        }
        if self.hinge {
            flags |= FLAG_HINGE;
        }
        out.push(flags);
        out.extend_from_slice(&self.weight.to_le_bytes());
        out.extend_from_slice(&self.constant.to_le_bytes());
        debug_assert!(self.size() <= MAX_TERM_SIZE);
        out.extend_from_slice(&(self.size() as u16).to_le_bytes());
        for (coefficient, atom) in self.coefficients.iter().zip(self.atoms.iter()) {
            out.extend_from_slice(&coefficient.to_le_bytes());
            out.extend_from_slice(&atom.to_le_bytes());
        }
    }

    // Decodes in place; the inline vectors keep their storage between pages.
    fn read(&mut self, input: &mut ByteReader<'_>) -> Result<(), InferenceError> {
        let flags = input.read_u8()?;
        self.squared = flags & FLAG_SQUARED != 0;
        self.hinge = flags & FLAG_HINGE != 0;
        self.weight = input.read_f32()?;
        self.constant = input.read_f32()?;
        let size = input.read_u16()? as usize;
        self.coefficients.clear();
        self.atoms.clear();
        for _ in 0..size {
            self.coefficients.push(input.read_f32()?);
            self.atoms.push(input.read_u32()?);
        }
        Ok(())
    }
}

/// A term type the page store can cache.
///
/// `VOLATILE_SIZE` is the fixed record width of the per-term optimizer state
/// kept in the companion volatile page. Zero means the algorithm has no state
/// worth carrying between epochs and volatile pages are never written.
pub trait PageTerm: Default + Send + 'static {
    const VOLATILE_SIZE: usize;

    fn objective(&self) -> &ObjectiveTerm;

    fn encode(&self, out: &mut Vec<u8>);

    fn decode(&mut self, input: &mut ByteReader<'_>) -> Result<(), InferenceError>;

    fn encode_volatile(&self, _out: &mut Vec<u8>) {}

    fn decode_volatile(&mut self, _input: &mut ByteReader<'_>) -> Result<(), InferenceError> {
        Ok(())
    }

    /// Called by the optimizer after each visit with the term's current violation.
    fn record_step(&mut self, _violation: f32, _step_size: f32) {}
}

/// Stochastic gradient descent term. No volatile state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SgdTerm {
    pub term: ObjectiveTerm,
}

impl SgdTerm {
    pub fn new(term: ObjectiveTerm) -> Self {
        SgdTerm { term }
    }
}

impl PageTerm for SgdTerm {
    const VOLATILE_SIZE: usize = 0;

    fn objective(&self) -> &ObjectiveTerm {
        &self.term
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.term.write(out);
    }

    fn decode(&mut self, input: &mut ByteReader<'_>) -> Result<(), InferenceError> {
        self.term.read(input)
    }
}

/// Dual coordinate descent term. Carries its Lagrange multiplier across epochs.
///
/// The optimizer only records the multiplier after each step and never reads
/// it back into the update, so today it exists to give the volatile page a
/// real per-term payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DcdTerm {
    pub term: ObjectiveTerm,
    pub lagrange: f32,
}

impl DcdTerm {
    pub fn new(term: ObjectiveTerm) -> Self {
        DcdTerm { term, lagrange: 0.0 }
    }
}

impl PageTerm for DcdTerm {
    const VOLATILE_SIZE: usize = 4;

    fn objective(&self) -> &ObjectiveTerm {
        &self.term
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.term.write(out);
    }

    fn decode(&mut self, input: &mut ByteReader<'_>) -> Result<(), InferenceError> {
        self.term.read(input)
    }

    fn encode_volatile(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.lagrange.to_le_bytes());
    }

    fn decode_volatile(&mut self, input: &mut ByteReader<'_>) -> Result<(), InferenceError> {
        self.lagrange = input.read_f32()?;
        Ok(())
    }

    fn record_step(&mut self, violation: f32, step_size: f32) {
        self.lagrange = (self.lagrange + step_size * violation).clamp(0.0, self.term.weight);
    }
}
