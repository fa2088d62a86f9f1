use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::constants::DEFAULT_KEYSTREAM_BLOCK_SIZE;

/// Derives the secret shared by a server and a client.
///
/// The server id occupies the high 48 bits and the client id the low 16, so both sides of the
/// pair compute the same value regardless of which role does the packing.
///
/// # Examples
///
/// ```rust
/// use dcnet::cipher::shared_secret;
///
/// assert_eq!(shared_secret(1, 3), (1u64 << 16) | 3);
/// ```
pub fn shared_secret(server_id: usize, client_id: usize) -> u64 {
    ((server_id as u64) << 16) | (client_id as u64 & 0xffff)
}

/// XORs `src` into `dst`, over the shorter of the two lengths.
pub fn xor_bytes(src: &[u8], dst: &mut [u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

/// An infinite pseudorandom byte sequence derived from one shared secret.
///
/// Bytes are produced a block at a time and consumed through a cursor that survives across
/// calls. Both holders of a secret must consume exactly the same number of bytes in the same
/// order for the pads to cancel.
pub struct Keystream {
    rng: ChaCha20Rng,
    block: Vec<u8>,
    cursor: usize,
}

impl Keystream {
    /// Creates a keystream for `secret` with the default block size.
    pub fn new(secret: u64) -> Self {
        Self::with_block_size(secret, DEFAULT_KEYSTREAM_BLOCK_SIZE)
    }

    /// Creates a keystream for `secret` that refills `block_size` bytes at a time.
    ///
    /// # Arguments
    ///
    /// * `secret` - The seed shared with the other holder, see [`shared_secret`].
    /// * `block_size` - Bytes generated per refill. A zero size is raised to 1.
    ///
    /// The block size changes how often the generator runs, not the bytes produced, as long as
    /// it is a multiple of 4. Both holders of a secret should use the same value.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dcnet::cipher::Keystream;
    ///
    /// let mut a = Keystream::with_block_size(7, 16);
    /// let mut b = Keystream::with_block_size(7, 16);
    /// let mut message = *b"pad me";
    /// a.apply(&mut message);
    /// b.apply(&mut message);
    /// assert_eq!(&message, b"pad me");
    /// ```
    pub fn with_block_size(secret: u64, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Keystream {
            rng: ChaCha20Rng::seed_from_u64(secret),
            block: vec![0; block_size],
            // Start exhausted so the first byte triggers a refill.
            cursor: block_size,
        }
    }

    /// XORs the next `buffer.len()` keystream bytes into `buffer`.
    pub fn apply(&mut self, buffer: &mut [u8]) {
        let mut done = 0;
        while done < buffer.len() {
            if self.cursor == self.block.len() {
                self.rng.fill_bytes(&mut self.block);
                self.cursor = 0;
            }
            let take = (self.block.len() - self.cursor).min(buffer.len() - done);
            xor_bytes(
                &self.block[self.cursor..self.cursor + take],
                &mut buffer[done..done + take],
            );
            self.cursor += take;
            done += take;
        }
    }
}

/// The ordered set of keystreams one participant holds.
///
/// A client holds one keystream per server; a server holds one per client in the whole
/// deployment. `apply` always walks the keystreams in construction order.
pub struct KeystreamCipher {
    streams: Vec<Keystream>,
}

impl KeystreamCipher {
    /// One keystream per secret, applied in the given order.
    pub fn new(secrets: &[u64], block_size: usize) -> Self {
        KeystreamCipher {
            streams: secrets
                .iter()
                .map(|&secret| Keystream::with_block_size(secret, block_size))
                .collect(),
        }
    }

    /// Cipher for client `client_id`: one secret per server, in server id order.
    pub fn for_client(client_id: usize, num_servers: usize, block_size: usize) -> Self {
        let secrets: Vec<u64> = (0..num_servers)
            .map(|server| shared_secret(server, client_id))
            .collect();
        Self::new(&secrets, block_size)
    }

    /// Cipher for server `server_id`: one secret per client of the deployment, connected or
    /// not, in client id order.
    pub fn for_server(server_id: usize, num_clients: usize, block_size: usize) -> Self {
        let secrets: Vec<u64> = (0..num_clients)
            .map(|client| shared_secret(server_id, client))
            .collect();
        Self::new(&secrets, block_size)
    }

    /// Masks `buffer` with every keystream, advancing each cursor by `buffer.len()`.
    pub fn apply(&mut self, buffer: &mut [u8]) {
        for stream in self.streams.iter_mut() {
            stream.apply(buffer);
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
