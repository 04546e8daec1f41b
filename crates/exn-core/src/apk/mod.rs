//! Static facts about the APK: badging metadata and the decompiled tree.

pub mod badging;
pub mod decompile;

pub use badging::{parse_badging, read_badging, ApkBadging};
pub use decompile::{DecompiledTree, Decompiler, JadxDecompiler};
