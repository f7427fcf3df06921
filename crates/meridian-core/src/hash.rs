/// Convenience functions for doing things with a thread-local xxhash hasher.
pub(crate) mod thread_local_xxhash {
    use std::cell::RefCell;
    use xxhash_rust::xxh64::Xxh64;

    // gRPC and Envoy both use a zero seed for ring hash.
    //
    // https://github.com/grpc/proposal/blob/master/A42-xds-ring-hash-lb-policy.md#xdsconfigselector-changes
    const SEED: u64 = 0;

    thread_local! {
        static HASHER: RefCell<Xxh64> = const { RefCell::new(Xxh64::new(SEED)) };
    }

    /// Hash raw bytes. Matches `XXH64(bytes, 0)` in other implementations,
    /// unlike [hash] which goes through [std::hash::Hash] and adds length
    /// prefixes.
    pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
        xxhash_rust::xxh64::xxh64(bytes, SEED)
    }

    /// Hash a single item using a thread-local [xx64 Hasher][Xxh64].
    pub(crate) fn hash<H: std::hash::Hash>(h: &H) -> u64 {
        HASHER.with_borrow_mut(|hasher| {
            hasher.reset(SEED);
            h.hash(hasher);
            hasher.digest()
        })
    }
}
