//! Check command: run the startup hooks without watching anything.

use std::sync::Arc;

use crate::config::Settings;
use crate::plugins;
use crate::watchdog::{SeenState, Watchdog};

pub fn run_check(settings: Settings) -> anyhow::Result<()> {
    settings.validate()?;
    let settings = Arc::new(settings);

    let mut watchdog = Watchdog::new(Arc::clone(&settings), SeenState::temporary()?);
    let loaded = watchdog.load_plugins(plugins::autoload(&settings)?);
    let pipeline = watchdog.prepare()?;

    println!("host: {}", pipeline.host_id);
    println!("plugins: {loaded} active");
    for (biz, rule) in &pipeline.rules {
        let strategies: Vec<String> = pipeline
            .strategies_for(biz)
            .iter()
            .map(ToString::to_string)
            .collect();
        let handlers = pipeline
            .chains
            .get(biz)
            .map(|chain| chain.names().join(" > "))
            .unwrap_or_else(|| "(none)".to_string());

        println!();
        println!("[{biz}]");
        println!("  path       {}", rule.monitor_path().display());
        println!("  strategy   {}", strategies.join(", "));
        println!("  depth      {}", describe_depth(rule.max_depth));
        println!("  debounce   {}ms", rule.debounce_interval.as_millis());
        if let Some(pattern) = rule.include_pattern() {
            println!("  include    {pattern}");
        }
        if let Some(pattern) = rule.exclude_pattern() {
            println!("  exclude    {pattern}");
        }
        println!("  handlers   {handlers}");
    }
    Ok(())
}

fn describe_depth(max_depth: usize) -> String {
    if max_depth == 0 {
        "unlimited".to_string()
    } else {
        max_depth.to_string()
    }
}
