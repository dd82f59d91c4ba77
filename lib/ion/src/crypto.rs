use ctor::ctor;
use libsodium_sys;
use std::mem::MaybeUninit;
use std::os::raw::c_void;

pub const HMAC_SIZE: usize = libsodium_sys::crypto_auth_hmacsha256_BYTES as usize;
pub const HMAC_KEY_SIZE: usize = libsodium_sys::crypto_auth_hmacsha256_KEYBYTES as usize;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Incremental HMAC-SHA256 over a keyed message.
pub struct HmacSha256 {
    state: libsodium_sys::crypto_auth_hmacsha256_state,
}

impl HmacSha256 {
    #[inline]
    pub fn new(key: &[u8; HMAC_KEY_SIZE]) -> HmacSha256 {
        unsafe {
            let mut state = MaybeUninit::uninit();
            if libsodium_sys::crypto_auth_hmacsha256_init(state.as_mut_ptr(), key.as_ptr(), key.len()) != 0 {
                panic!("HMAC initialization failed")
            }
            HmacSha256 {
                state: state.assume_init(),
            }
        }
    }

    #[inline]
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        unsafe {
            if libsodium_sys::crypto_auth_hmacsha256_update(&mut self.state, data.as_ptr(), data.len() as u64)
                != 0
            {
                panic!("HMAC update failed")
            }
        }
        self
    }

    #[inline]
    pub fn finish(mut self) -> [u8; HMAC_SIZE] {
        let mut out = [0u8; HMAC_SIZE];
        unsafe {
            if libsodium_sys::crypto_auth_hmacsha256_final(&mut self.state, out.as_mut_ptr()) != 0 {
                panic!("HMAC finalization failed")
            }
        }
        out
    }
}

/// Computes HMAC-SHA256 over the concatenation of `parts` under `key`.
#[inline]
pub fn hmac_sha256(key: &[u8; HMAC_KEY_SIZE], parts: &[&[u8]]) -> [u8; HMAC_SIZE] {
    let mut hmac = HmacSha256::new(key);
    for part in parts {
        hmac.update(part);
    }
    hmac.finish()
}

/// Compares two byte strings in constant time. The lengths must match.
#[inline]
pub fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }

    unsafe {
        libsodium_sys::sodium_memcmp(
            lhs.as_ptr() as *const c_void,
            rhs.as_ptr() as *const c_void,
            lhs.len(),
        ) == 0
    }
}

/// Fills the supplied buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(buf: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(buf.as_mut_ptr() as *mut c_void, buf.len());
    }
}
