use clap::{App, Arg};
use lattice::config;
use std::fs;

fn main() {
    let matches = App::new("Nodes File Checker")
        .version("1.0")
        .author("Lattice Works")
        .about("Validates a nodes file and prints the parsed addresses.")
        .arg(
            Arg::with_name("FILE")
                .help("Path to the nodes file")
                .required(true),
        )
        .get_matches();

    let path = matches.value_of("FILE").unwrap();
    let text = fs::read_to_string(path).expect("Error reading nodes file");

    match config::parse_nodes(&text) {
        Ok(nodes) => {
            for node in &nodes {
                println!("{}", node);
            }
            println!("{} node(s) ok", nodes.len());
        }
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    }
}
