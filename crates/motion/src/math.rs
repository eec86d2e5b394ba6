//! f32 helpers that work on both the std and `no_std` paths.

#[cfg(not(feature = "std"))]
pub(crate) use libm::{ceilf, fabsf, floorf, roundf, sqrtf};

#[cfg(feature = "std")]
pub(crate) fn sqrtf(x: f32) -> f32 {
    x.sqrt()
}

#[cfg(feature = "std")]
pub(crate) fn ceilf(x: f32) -> f32 {
    x.ceil()
}

#[cfg(feature = "std")]
pub(crate) fn floorf(x: f32) -> f32 {
    x.floor()
}

#[cfg(feature = "std")]
pub(crate) fn fabsf(x: f32) -> f32 {
    x.abs()
}

#[cfg(feature = "std")]
pub(crate) fn roundf(x: f32) -> f32 {
    x.round()
}

pub(crate) fn fminf(a: f32, b: f32) -> f32 {
    if a < b {
        a
    } else {
        b
    }
}

pub(crate) fn fmaxf(a: f32, b: f32) -> f32 {
    if a > b {
        a
    } else {
        b
    }
}
