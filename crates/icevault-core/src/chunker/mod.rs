use std::io::Read;

/// Polynomial seed the boundary gear table is derived from. Changing it
/// changes every chunk boundary, so it is part of the on-store format.
pub const POLYNOMIAL_SEED: u64 = 0x3dea92648f6e83;

pub const MIN_CHUNK_SIZE: usize = 512 * 1024;
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Read-buffer bound for chunk upload paths; the chunker never emits a
/// chunk larger than this.
pub const CHUNK_UPLOAD_LOWER_BOUND: usize = MAX_CHUNK_SIZE;

/// Boundary mask width: a cut point triggers roughly once per 2^20 bytes,
/// between the min/max bounds.
const BOUNDARY_MASK_BITS: u32 = 20;

const READ_BLOCK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ChunkerParams {
    pub min_size: usize,
    pub max_size: usize,
    pub boundary_mask: u64,
}

impl Default for ChunkerParams {
    fn default() -> Self {
        Self {
            min_size: MIN_CHUNK_SIZE,
            max_size: MAX_CHUNK_SIZE,
            boundary_mask: (1u64 << BOUNDARY_MASK_BITS) - 1,
        }
    }
}

/// One content-defined chunk of a source stream.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Byte offset of this chunk within its source.
    pub start: u64,
    pub length: u32,
    pub data: Vec<u8>,
}

/// Streaming rolling-hash content-defined chunker.
///
/// Boundaries depend only on the content: the rolling hash is reset at
/// each cut point and re-warmed from the bytes that follow it, so
/// identical byte sequences produce identical boundaries regardless of
/// where they sit in the stream.
pub struct Chunker<R> {
    source: R,
    table: Box<[u64; 256]>,
    params: ChunkerParams,
    buf: Vec<u8>,
    offset: u64,
    eof: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(source: R) -> Self {
        Self::with_params(source, POLYNOMIAL_SEED, ChunkerParams::default())
    }

    pub fn with_params(source: R, seed: u64, params: ChunkerParams) -> Self {
        Self {
            source,
            table: gear_table(seed),
            params,
            buf: Vec::with_capacity(params.max_size),
            offset: 0,
            eof: false,
        }
    }

    /// Produce the next chunk, or `None` at end of stream.
    pub fn next_chunk(&mut self) -> std::io::Result<Option<Chunk>> {
        self.fill()?;
        if self.buf.is_empty() {
            return Ok(None);
        }

        let cut = self.find_boundary();
        let data: Vec<u8> = self.buf.drain(..cut).collect();
        let chunk = Chunk {
            start: self.offset,
            length: data.len() as u32,
            data,
        };
        self.offset += cut as u64;
        Ok(Some(chunk))
    }

    /// Top the buffer up to `max_size` (or EOF).
    fn fill(&mut self) -> std::io::Result<()> {
        while !self.eof && self.buf.len() < self.params.max_size {
            let old_len = self.buf.len();
            let want = (self.params.max_size - old_len).min(READ_BLOCK_SIZE);
            self.buf.resize(old_len + want, 0);
            match self.source.read(&mut self.buf[old_len..old_len + want]) {
                Ok(0) => {
                    self.buf.truncate(old_len);
                    self.eof = true;
                }
                Ok(n) => self.buf.truncate(old_len + n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    self.buf.truncate(old_len);
                }
                Err(e) => {
                    self.buf.truncate(old_len);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Scan the buffered window for a boundary. Returns the end-exclusive
    /// cut offset into `buf`.
    fn find_boundary(&self) -> usize {
        let available = self.buf.len();
        if available <= self.params.min_size {
            return available;
        }

        let limit = available.min(self.params.max_size);
        let mut hash = 0u64;
        for i in self.params.min_size..limit {
            hash = (hash << 1).wrapping_add(self.table[self.buf[i] as usize]);
            if hash & self.params.boundary_mask == 0 {
                return i + 1;
            }
        }
        limit
    }
}

/// Derive the 256-entry gear table from the polynomial seed via a
/// splitmix expansion, so boundaries are a pure function of the seed.
fn gear_table(seed: u64) -> Box<[u64; 256]> {
    let mut table = Box::new([0u64; 256]);
    let mut state = seed;
    for entry in table.iter_mut() {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        *entry = z ^ (z >> 31);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> ChunkerParams {
        ChunkerParams {
            min_size: 64,
            max_size: 1024,
            boundary_mask: (1 << 7) - 1,
        }
    }

    fn chunk_all(data: &[u8], params: ChunkerParams) -> Vec<Chunk> {
        let mut chunker = Chunker::with_params(data, POLYNOMIAL_SEED, params);
        let mut chunks = Vec::new();
        while let Some(chunk) = chunker.next_chunk().unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    fn pseudo_random(len: usize, mut state: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        for byte in &mut data {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *byte = (state >> 33) as u8;
        }
        data
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunks = chunk_all(&[], small_params());
        assert!(chunks.is_empty());
    }

    #[test]
    fn input_below_min_size_is_one_chunk() {
        let data = pseudo_random(40, 1);
        let chunks = chunk_all(&data, small_params());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].data, data);
    }

    #[test]
    fn chunks_are_contiguous_and_reassemble() {
        let data = pseudo_random(64 * 1024, 2);
        let chunks = chunk_all(&data, small_params());
        assert!(chunks.len() > 1);

        let mut expected_start = 0u64;
        let mut reassembled = Vec::new();
        for chunk in &chunks {
            assert_eq!(chunk.start, expected_start);
            assert_eq!(chunk.length as usize, chunk.data.len());
            expected_start += chunk.length as u64;
            reassembled.extend_from_slice(&chunk.data);
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn size_bounds_are_respected() {
        let params = small_params();
        let data = pseudo_random(128 * 1024, 3);
        let chunks = chunk_all(&data, params);

        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.data.len() <= params.max_size);
            if i + 1 < chunks.len() {
                assert!(
                    chunk.data.len() >= params.min_size,
                    "non-final chunk {} below min size: {}",
                    i,
                    chunk.data.len()
                );
            }
        }
    }

    #[test]
    fn boundaries_are_deterministic() {
        let data = pseudo_random(96 * 1024, 4);
        let a = chunk_all(&data, small_params());
        let b = chunk_all(&data, small_params());
        let lengths = |chunks: &[Chunk]| chunks.iter().map(|c| c.length).collect::<Vec<_>>();
        assert_eq!(lengths(&a), lengths(&b));
    }

    #[test]
    fn identical_content_yields_identical_boundaries_across_streams() {
        let data = pseudo_random(64 * 1024, 5);
        let direct = chunk_all(&data, small_params());

        // Same bytes through a fragmenting reader: one byte per read call.
        struct TrickleReader<'a>(&'a [u8]);
        impl Read for TrickleReader<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0.is_empty() || buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.0[0];
                self.0 = &self.0[1..];
                Ok(1)
            }
        }

        let mut chunker =
            Chunker::with_params(TrickleReader(&data), POLYNOMIAL_SEED, small_params());
        let mut trickled = Vec::new();
        while let Some(chunk) = chunker.next_chunk().unwrap() {
            trickled.push(chunk);
        }

        assert_eq!(direct.len(), trickled.len());
        for (a, b) in direct.iter().zip(&trickled) {
            assert_eq!(a.start, b.start);
            assert_eq!(a.data, b.data);
        }
    }

    #[test]
    fn shared_suffix_realigns_after_prefix_insertion() {
        let base = pseudo_random(256 * 1024, 6);
        let mut shifted = pseudo_random(4 * 1024, 7);
        shifted.extend_from_slice(&base);

        let base_lengths: Vec<u32> = chunk_all(&base, small_params())
            .iter()
            .map(|c| c.length)
            .collect();
        let shifted_lengths: Vec<u32> = chunk_all(&shifted, small_params())
            .iter()
            .map(|c| c.length)
            .collect();

        // Content-defined boundaries: the tail of both length sequences
        // converges once the hash window clears the inserted prefix.
        let tail = &base_lengths[base_lengths.len() - 3..];
        assert!(
            shifted_lengths
                .windows(tail.len())
                .any(|window| window == tail),
            "no realigned boundary run found: base {base_lengths:?}, shifted {shifted_lengths:?}"
        );
    }

    #[test]
    fn uniform_data_cuts_at_max_size() {
        let params = small_params();
        let data = vec![0x42u8; params.max_size * 3];
        let chunks = chunk_all(&data, params);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.data.len() <= params.max_size);
        }
    }

    #[test]
    fn default_params_cover_the_advertised_bounds() {
        let params = ChunkerParams::default();
        assert_eq!(params.min_size, MIN_CHUNK_SIZE);
        assert_eq!(params.max_size, MAX_CHUNK_SIZE);
        assert_eq!(CHUNK_UPLOAD_LOWER_BOUND, MAX_CHUNK_SIZE);
    }

    #[test]
    fn gear_table_is_seed_dependent() {
        let a = gear_table(POLYNOMIAL_SEED);
        let b = gear_table(POLYNOMIAL_SEED);
        let c = gear_table(POLYNOMIAL_SEED + 1);
        assert_eq!(a[..], b[..]);
        assert_ne!(a[..], c[..]);
    }
}
