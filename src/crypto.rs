use std::hash::{Hash, Hasher};

use sha2::{Digest, Sha256};

// Hash based digest deriving solution
// There's no well known solution for deriving digest methods to general
// structural data i.e. structs and enums (as far as I know), which means to
// compute a digest for a structural value one has to do either:
//   specify the traversal manually
//   derive `Hash` and make use of it
//   derive `Serialize` and make use of it
// currently the second approach is taken. the benefit is `Hash` semantic
// guarantees the desired reproducibility. endianness is addressed manually
// below so the digest is reproducible across platforms.

pub trait DigestHasher {
    fn write(&mut self, bytes: &[u8]);
}

impl DigestHasher for Sha256 {
    fn write(&mut self, bytes: &[u8]) {
        self.update(bytes)
    }
}

struct ImplHasher<'a, T>(&'a mut T);

impl<T: DigestHasher> Hasher for ImplHasher<'_, T> {
    fn write(&mut self, bytes: &[u8]) {
        self.0.write(bytes)
    }

    fn write_u16(&mut self, i: u16) {
        self.0.write(&i.to_le_bytes())
    }

    fn write_u32(&mut self, i: u32) {
        self.0.write(&i.to_le_bytes())
    }

    fn write_u64(&mut self, i: u64) {
        self.0.write(&i.to_le_bytes())
    }

    fn write_usize(&mut self, i: usize) {
        self.0.write(&i.to_le_bytes())
    }

    fn write_i16(&mut self, i: i16) {
        self.0.write(&i.to_le_bytes())
    }

    fn write_i32(&mut self, i: i32) {
        self.0.write(&i.to_le_bytes())
    }

    fn write_i64(&mut self, i: i64) {
        self.0.write(&i.to_le_bytes())
    }

    fn write_isize(&mut self, i: isize) {
        self.0.write(&i.to_le_bytes())
    }

    fn finish(&self) -> u64 {
        unimplemented!()
    }
}

pub trait DigestHash: Hash {
    fn hash(&self, state: &mut impl DigestHasher) {
        Hash::hash(self, &mut ImplHasher(state))
    }

    fn sha256(&self) -> [u8; 32] {
        let mut state = Sha256::new();
        DigestHash::hash(self, &mut state);
        state.finalize().into()
    }
}

impl<T: Hash> DigestHash for T {}
