fn main() {
    if let Err(e) = dispatch_panel_lib::run() {
        eprintln!("dispatch-panel: {e:#}");
        std::process::exit(1);
    }
}
