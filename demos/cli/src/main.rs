use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;
use nalgebra::Vector3;

use oemm::soup::SoupWriter;
use oemm::storage::read_structure;
use oemm::{MeshReader, Settings};

/// Out-of-core mesh tool
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a leaf-partitioned index from a triangle soup file
    Import {
        /// Input `.soup` file
        #[clap(short, long)]
        input: PathBuf,

        /// Directory to write the index into
        #[clap(short, long)]
        out: PathBuf,

        #[clap(flatten)]
        settings: IndexSettings,
    },

    /// Print statistics for an existing index
    Info {
        /// Index directory
        #[clap(short, long)]
        dir: PathBuf,

        /// List every leaf instead of just totals
        #[clap(short, long)]
        leaves: bool,
    },

    /// Load leaves from an index and write a binary STL
    Export {
        /// Index directory
        #[clap(short, long)]
        dir: PathBuf,

        /// Name of a `.stl` file to write
        #[clap(short, long)]
        out: PathBuf,

        /// Leaf indices to load (loads everything when empty)
        #[clap(short, long)]
        leaf: Vec<u32>,
    },

    /// Generate a UV-sphere triangle soup (for testing)
    Sphere {
        /// Name of a `.soup` file to write
        #[clap(short, long)]
        out: PathBuf,

        /// Number of latitude bands
        #[clap(short, long, default_value_t = 64)]
        rows: u32,

        /// Sphere radius
        #[clap(long, default_value_t = 1.0)]
        radius: f64,
    },
}

#[derive(Parser)]
struct IndexSettings {
    /// Octree depth
    #[clap(short, long, default_value_t = 8)]
    level: u32,

    /// Maximum triangle count per leaf
    #[clap(short, long, default_value_t = 50_000)]
    max_triangles: u32,
}

////////////////////////////////////////////////////////////////////////////////

fn run_import(input: &PathBuf, out: &PathBuf, settings: &IndexSettings) -> Result<()> {
    let start = Instant::now();
    let settings = Settings {
        level: settings.level,
        max_triangles: settings.max_triangles,
    };
    std::fs::create_dir_all(out)?;
    let tree = oemm::build_index(input, out, &settings)
        .with_context(|| format!("failed to index {input:?}"))?;
    info!(
        "Indexed {} triangles into {} leaves in {:?}",
        tree.leaves().map(|n| tree.node(n).tn as u64).sum::<u64>(),
        tree.leaf_count(),
        start.elapsed()
    );
    Ok(())
}

fn run_info(dir: &PathBuf, list_leaves: bool) -> Result<()> {
    let tree = read_structure(dir)?;
    let mut tn = 0u64;
    let mut vn = 0u64;
    for id in tree.leaves() {
        let node = tree.node(id);
        tn += node.tn as u64;
        vn += node.vn as u64;
        if list_leaves {
            println!(
                "leaf {:>6}  path {:<24}  tn {:>8}  vn {:>8}  labels {}..={}",
                node.leaf_index, node.path, node.tn, node.vn, node.min_index, node.max_index,
            );
        }
    }
    println!("{} leaves, {tn} triangles, {vn} vertices", tree.leaf_count());
    println!(
        "origin ({}, {}, {}), scale {}",
        tree.origin.x, tree.origin.y, tree.origin.z, tree.scale
    );
    Ok(())
}

fn run_export(dir: &PathBuf, out: &PathBuf, leaf: &[u32]) -> Result<()> {
    let start = Instant::now();
    let tree = read_structure(dir)?;
    let reader = MeshReader::new(&tree, dir);
    let mesh = if leaf.is_empty() {
        reader.read_all()?
    } else {
        for &l in leaf {
            if l as usize >= tree.leaf_count() {
                bail!("leaf {l} is out of range (index has {})", tree.leaf_count());
            }
        }
        reader.read(leaf)?
    };
    info!(
        "Loaded {} vertices / {} triangles in {:?}",
        mesh.vertices.len(),
        mesh.triangles.len(),
        start.elapsed()
    );
    let mut f = std::io::BufWriter::new(std::fs::File::create(out)?);
    write_stl(&mut f, &mesh)?;
    info!("Wrote STL to {out:?}");
    Ok(())
}

/// Writes a binary STL; triangles with unloaded corners are skipped
fn write_stl<W: Write>(w: &mut W, mesh: &oemm::Mesh) -> Result<()> {
    let count = mesh.triangles.iter().filter(|t| t.readable).count();
    w.write_all(&[0u8; 80])?;
    w.write_all(&u32::try_from(count)?.to_le_bytes())?;
    for t in mesh.triangles.iter().filter(|t| t.readable) {
        let p: Vec<Vector3<f64>> = t.v.iter().map(|&i| mesh.vertices[i].pos).collect();
        let mut n = (p[1] - p[0]).cross(&(p[2] - p[0]));
        let len = n.norm();
        if len > 0.0 {
            n /= len;
        }
        for v in [n, p[0], p[1], p[2]] {
            for c in 0..3 {
                w.write_all(&(v[c] as f32).to_le_bytes())?;
            }
        }
        w.write_all(&[0u8; 2])?;
    }
    Ok(())
}

fn run_sphere(out: &PathBuf, rows: u32, radius: f64) -> Result<()> {
    if rows < 2 {
        bail!("a sphere needs at least 2 latitude bands");
    }
    let cols = rows * 2;
    let point = |row: u32, col: u32| -> Vector3<f64> {
        let theta = std::f64::consts::PI * row as f64 / rows as f64;
        let phi = std::f64::consts::TAU * col as f64 / cols as f64;
        Vector3::new(
            radius * theta.sin() * phi.cos(),
            radius * theta.sin() * phi.sin(),
            radius * theta.cos(),
        )
    };
    let mut soup = SoupWriter::create(out)?;
    let mut count = 0u64;
    for row in 0..rows {
        for col in 0..cols {
            let a = point(row, col);
            let b = point(row + 1, col);
            let c = point(row + 1, col + 1);
            let d = point(row, col + 1);
            if row != 0 {
                soup.add(&[a, b, d], 0)?;
                count += 1;
            }
            if row != rows - 1 {
                soup.add(&[b, c, d], 0)?;
                count += 1;
            }
        }
    }
    soup.finish()?;
    info!("Wrote {count} triangles to {out:?}");
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match args.cmd {
        Command::Import {
            input,
            out,
            settings,
        } => run_import(&input, &out, &settings),
        Command::Info { dir, leaves } => run_info(&dir, leaves),
        Command::Export { dir, out, leaf } => run_export(&dir, &out, &leaf),
        Command::Sphere { out, rows, radius } => run_sphere(&out, rows, radius),
    }
}
