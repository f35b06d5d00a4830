use exfat::{Filesystem, NodeRef};

fn prompt(separator: &str) -> Option<Vec<String>> {
    use std::io::Write;
    let mut line = String::new();
    print!("{separator}");
    std::io::stdout().flush().ok()?;
    match std::io::stdin().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.split_whitespace().map(str::to_string).collect()),
    }
}

fn list(fs: &mut Filesystem, dir: &NodeRef) -> Result<(), Box<dyn std::error::Error>> {
    let mut cursor = fs.opendir(dir)?;
    while let Some(child) = fs.readdir(&mut cursor) {
        let stat = fs.stat(&child);
        let node = fs.node(&child);
        let kind = if node.is_directory() { 'd' } else { '-' };
        println!["{kind} {:>12} {:>10} {}", stat.size, node.start_cluster(), node.name()];
    }
    fs.closedir(cursor)?;
    Ok(())
}

fn dump(fs: &mut Filesystem, file: &NodeRef) -> Result<(), Box<dyn std::error::Error>> {
    use std::io::Write;
    let mut buffer = vec![0u8; fs.superblock().cluster_size() as usize];
    let mut offset = 0;
    let mut stdout = std::io::stdout().lock();
    loop {
        let read = fs.pread(file, &mut buffer, offset)?;
        if read == 0 {
            break;
        }
        stdout.write_all(&buffer[..read])?;
        offset += read as u64;
    }
    stdout.flush()?;
    Ok(())
}

fn execute(fs: &mut Filesystem, cmd: &[String]) -> Result<bool, Box<dyn std::error::Error>> {
    let path = cmd.get(1).map(String::as_str).unwrap_or("/");
    match cmd.first().map(String::as_str) {
        Some("s") => {
            println!["{}", fs.superblock()];
            print!["{}", fs.info()];
        }
        Some("b") => {
            let statfs = fs.statfs();
            println![
                "{} of {} clusters free",
                statfs.blocks_free,
                fs.superblock().cluster_count()
            ];
        }
        Some("l") => {
            let dir = fs.lookup(path)?;
            list(fs, &dir)?;
        }
        Some("n") => {
            let node = fs.lookup(path)?;
            println!["{}", fs.node(&node)];
            println!["{:?}", fs.stat(&node)];
        }
        Some("c") => {
            let file = fs.lookup(path)?;
            dump(fs, &file)?;
        }
        Some("u") => {
            for (first, last) in fs.used_sectors() {
                println!["{first}-{last}"];
            }
        }
        Some("q") => return Ok(false),
        Some(other) => eprintln!("Unknown command '{other}'"),
        None => {}
    }
    Ok(true)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let Some(path) = std::env::args().nth(1) else {
        eprintln!("Usage: debugger <device>");
        std::process::exit(1);
    };
    let mut fs = Filesystem::open(&path, "ro")?;
    if !fs.label().is_empty() {
        println!["Volume '{}'", fs.label()];
    }
    while let Some(cmd) = prompt(">> ") {
        match execute(&mut fs, &cmd) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("{e}"),
        }
    }
    fs.unmount()?;
    Ok(())
}
