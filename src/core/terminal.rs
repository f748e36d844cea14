use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GLOBE: Emoji<'_, '_> = Emoji("🌐 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_banner() {
    println!(
        "\n{}\n{}\n",
        style("batchline").bold().cyan(),
        style("One batch at a time, live.").dim()
    );
}

/// Small builder for the aligned help/status blocks the CLI prints.
pub struct GuideSection {
    title: String,
    lines: Vec<String>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, desc: &str) -> Self {
        self.lines.push(format!(
            "  {:<18} {}",
            style(name).green().bold(),
            desc
        ));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines.push(format!(
            "  {} {}: {}",
            GEAR,
            style(label).bold().cyan(),
            value
        ));
        self
    }

    pub fn info(mut self, msg: &str) -> Self {
        self.lines.push(format!("  {}", msg));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(String::new());
        self
    }

    pub fn print(self) {
        println!("\n {}", style(self.title).bold().underlined());
        for line in self.lines {
            println!("{}", line);
        }
    }
}
