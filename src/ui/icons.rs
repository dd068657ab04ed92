//! Shared status icons for step and run output.

use console::Emoji;

// Step results
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Run state
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static PENDING: Emoji<'_, '_> = Emoji("⏳ ", "[ ]");
pub static REBOOT: Emoji<'_, '_> = Emoji("🔄 ", "[REBOOT]");
pub static DRY_RUN: Emoji<'_, '_> = Emoji("🧪 ", "[DRY]");
