use gridmask_core::StepInfo;
use std::error::Error;
use std::fs::File;
use std::io::{self, BufRead, BufReader};

fn main() -> Result<(), Box<dyn Error>> {
    let path = std::env::args().nth(1);
    let reader: Box<dyn BufRead> = match path {
        Some(p) => Box::new(BufReader::new(File::open(p)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let info: StepInfo = serde_json::from_str(&line)?;

        match &info.valid_action_tree {
            Some(tree) => println!("{}\tdepth={}", tree.count_leaves(), tree.depth()),
            None => println!("1\t<default>"),
        }
    }

    Ok(())
}
