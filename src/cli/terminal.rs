use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

/// A titled block of `command  description` lines for help output.
pub struct HelpSection {
    title: &'static str,
    entries: Vec<(&'static str, &'static str)>,
}

impl HelpSection {
    pub fn new(title: &'static str) -> Self {
        Self {
            title,
            entries: Vec::new(),
        }
    }

    pub fn entry(mut self, usage: &'static str, description: &'static str) -> Self {
        self.entries.push((usage, description));
        self
    }

    pub fn print(&self) {
        let width = self.entries.iter().map(|(u, _)| u.len()).max().unwrap_or(0);
        println!("\n {}", style(self.title).bold().underlined());
        for (usage, description) in &self.entries {
            let padded = format!("{usage:width$}");
            println!("   {}  {}", style(padded).green(), description);
        }
    }
}
