/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! A single-threaded free-list object pool.
//!
//! Grounded on the redesign note to retain object pools as explicit
//! freelists that eliminate allocation on hot paths, and on the
//! teacher's pooling discipline in `context.rs`/`service.rs`, where
//! request/response buffers and orders are recycled rather than dropped.
//! Returning an object still borrowed elsewhere is a caller bug, not
//! something this type tries to prevent at runtime — the core is
//! single-threaded and single-owner by construction.

/// A freelist of reusable `T`s plus a factory for minting new ones when the
/// list is empty.
pub struct Pool<T> {
    free: Vec<T>,
    factory: Box<dyn FnMut() -> T>,
}

impl<T> Pool<T> {
    pub fn new<F>(factory: F) -> Pool<T>
    where
        F: FnMut() -> T + 'static,
    {
        Pool {
            free: Vec::new(),
            factory: Box::new(factory),
        }
    }

    /// Takes an object from the pool, minting a new one if none are free.
    pub fn take(&mut self) -> T {
        self.free.pop().unwrap_or_else(|| (self.factory)())
    }

    /// Returns an object to the pool for reuse.
    pub fn give_back(&mut self, item: T) {
        self.free.push(item);
    }

    /// Number of objects currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_objects() {
        let mut next = 0u32;
        let mut pool: Pool<u32> = Pool::new(move || {
            next += 1;
            next
        });
        let a = pool.take();
        assert_eq!(a, 1);
        pool.give_back(a);
        let b = pool.take();
        assert_eq!(b, 1, "should reuse the returned object, not mint a new one");
        let c = pool.take();
        assert_eq!(c, 2, "pool was empty, should mint a fresh object");
    }
}
