use anyhow::Result;

use retrogate::config::preset::builtin_presets;

pub fn cmd_presets() -> Result<()> {
    println!("Built-in presets:");
    for (name, description) in builtin_presets() {
        if description.is_empty() {
            println!("  {name}");
        } else {
            println!("  {name:<24} {description}");
        }
    }
    println!();
    println!("Use with: retrogate serve --preset <name>");
    Ok(())
}
