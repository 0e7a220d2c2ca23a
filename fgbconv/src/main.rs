use clap::{Parser, ValueEnum};
use flatgeobuf_core::{FgbSequentialReader, FgbWriter, FgbWriterOptions, GeometryType, PackedRTree};
use geozero::geojson::{GeoJsonReader, GeoJsonWriter};
use geozero::GeozeroDatasource;
use log::info;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Convert between GeoJSON and FlatGeobuf
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input path, `-` for stdin
    input: String,

    /// Output path, `-` for stdout
    output: String,

    /// Input format, guessed from the file extension if omitted
    #[arg(long, value_enum)]
    inputformat: Option<Format>,

    /// Output format, guessed from the file extension if omitted
    #[arg(long, value_enum)]
    outputformat: Option<Format>,

    /// Write FlatGeobuf without spatial index
    #[arg(long)]
    no_index: bool,

    /// Branching factor of the spatial index
    #[arg(long, default_value_t = PackedRTree::DEFAULT_NODE_SIZE)]
    node_size: u16,

    /// Dataset name stored in the FlatGeobuf header
    #[arg(long)]
    name: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Flatgeobuf,
    Geojson,
}

impl Format {
    fn from_path(path: &str) -> Format {
        match Path::new(path).extension().and_then(|ext| ext.to_str()) {
            Some("fgb") => Format::Flatgeobuf,
            _ => Format::Geojson,
        }
    }
}

fn write(
    format: Format,
    reader: impl GeozeroDatasource,
    output: impl Write,
    args: &Args,
) -> Result<()> {
    match format {
        Format::Geojson => write_geojson(reader, output)?,
        Format::Flatgeobuf => write_flatgeobuf(reader, output, args)?,
    }
    Ok(())
}

fn write_geojson(mut reader: impl GeozeroDatasource, mut output: impl Write) -> Result<()> {
    let mut writer = GeoJsonWriter::new(&mut output);
    reader.process(&mut writer)?;
    output.flush()?;
    Ok(())
}

fn write_flatgeobuf(
    reader: impl GeozeroDatasource,
    mut output: impl Write,
    args: &Args,
) -> Result<()> {
    let name = args.name.as_deref().unwrap_or("");
    let options = FgbWriterOptions {
        write_index: !args.no_index,
        index_node_size: args.node_size,
        ..Default::default()
    };
    // the geometry type is detected from the features
    let mut writer = FgbWriter::create_with_options(name, GeometryType::Unknown, options)?;
    writer.add_datasource(reader)?;
    info!("Writing {} features", writer.features_count());
    writer.write(&mut output)?;
    output.flush()?;
    Ok(())
}

fn transform(mut input: impl BufRead, output: impl Write, args: &Args) -> Result<()> {
    let inputformat = args
        .inputformat
        .unwrap_or_else(|| Format::from_path(&args.input));
    let outputformat = args
        .outputformat
        .unwrap_or_else(|| Format::from_path(&args.output));
    info!("Converting {inputformat:?} to {outputformat:?}");
    match inputformat {
        Format::Geojson => write(outputformat, GeoJsonReader(&mut input), output, args)?,
        Format::Flatgeobuf => write(
            outputformat,
            FgbSequentialReader::open(&mut input)?.select_all()?,
            output,
            args,
        )?,
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let input: Box<dyn BufRead> = match args.input.as_str() {
        "-" => Box::new(BufReader::new(std::io::stdin())),
        path => Box::new(BufReader::new(File::open(path)?)),
    };
    let output: Box<dyn Write> = match args.output.as_str() {
        "-" => Box::new(BufWriter::new(std::io::stdout())),
        path => Box::new(BufWriter::new(File::create(path)?)),
    };
    transform(input, output, &args)
}
