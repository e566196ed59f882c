use std::env;

fn main() {
    let args: Vec<String> = env::args().collect();
    let result = if args.len() > 1 && args[1] == "--rebuild-embeddings" {
        screenrecall_lib::run_rebuild_embeddings()
    } else {
        screenrecall_lib::run()
    };
    if let Err(e) = result {
        eprintln!("screenrecall: {:#}", e);
        std::process::exit(1);
    }
}
