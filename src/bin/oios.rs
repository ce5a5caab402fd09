use clap::Parser;
use clap_num::maybe_hex;
use oneimage::host::{args_region_size, stage_arguments, Console};
use oneimage::image::{Image, ImageError};
use oneimage::trace::TraceLog;
use oneimage::vm::{Machine, Step, VmError};
use std::io::{self, Read, Write};
use std::process::ExitCode;

/// OneImage operating system: run a .oi bytecode image
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Path to the image file (.oi is appended if there is no extension)
    input: String,

    /// Arguments passed through to the guest program
    #[arg(trailing_var_arg = true)]
    guest_args: Vec<String>,

    /// Show the image header then exit
    #[arg(short = 'H', long)]
    header: bool,

    /// Enable tracing to the trace log
    #[arg(short, long)]
    trace: bool,

    /// Also trace each instruction (only takes effect with -t)
    #[arg(short, long)]
    instructions: bool,

    /// Trace log file
    #[arg(short, long, default_value = "oios.log")]
    log: String,

    /// Show performance information
    #[arg(short, long)]
    perf: bool,

    /// Single step through each instruction and print state
    #[arg(short, long)]
    debug: bool,

    /// Break on program counter match and begin debug stepping (use
    /// 0x prefix for hexadecimal)
    #[arg(short = 'b', long, value_parser = maybe_hex::<u64>)]
    pc_breakpoint: Option<u64>,
}

fn press_enter_to_continue() {
    let mut stdin = io::stdin();
    let mut stdout = io::stdout();

    write!(stdout, "Press enter to continue...").unwrap();
    stdout.flush().unwrap();

    // Read a single byte and discard
    let _ = stdin.read(&mut [0u8]).unwrap();
}

fn image_file_name(input: &str) -> String {
    if input.contains('.') {
        input.to_string()
    } else {
        format!("{input}.oi")
    }
}

fn run(args: &Args) -> Result<(), ImageError> {
    let file_name = image_file_name(&args.input);
    let image = Image::open(&file_name)?;
    let header = &image.header;

    if args.header {
        print!("{header}");
        return Ok(());
    }

    let image_width = header.image_width;
    let head_len = args_region_size(&file_name, &args.guest_args);
    let required = header.ram_required() + head_len;
    let available = Machine::<Console>::available_ram(image_width);
    if available < required {
        return Err(ImageError::InsufficientRam {
            required,
            available,
        });
    }

    let mut machine = Machine::new(Console::new());
    machine.reset(
        available,
        header.initial_pc(),
        available - head_len,
        image_width,
    );
    // argument and environment information lives above the top of stack
    stage_arguments(machine.ram_mut(), available, &file_name, &args.guest_args);
    machine.ram_mut().load(0, &image.payload);

    if args.trace {
        let mut log = TraceLog::create(&args.log)?;
        for line in header.to_string().lines() {
            log.line(line);
        }
        if args.instructions {
            machine.trace_instructions(Some(log));
        }
    }

    let mut total_instructions: u64 = 0;

    if args.debug || args.pc_breakpoint.is_some() {
        let mut stepping = args.debug;
        loop {
            if let Some(pc_breakpoint) = args.pc_breakpoint {
                if machine.regs().pc() == pc_breakpoint {
                    stepping = true;
                }
            }

            let step = match machine.step() {
                Ok(step) => step,
                Err(e) => {
                    total_instructions += 1;
                    println!("{e}");
                    if args.perf {
                        println!("total instructions executed: {total_instructions}");
                    }
                    std::process::exit(1);
                }
            };
            total_instructions += 1;

            print!("{}", machine.host_mut().flush_output());

            if stepping {
                println!("pc=0x{:x}", machine.regs().pc());
                print!("{}", machine.regs());
                press_enter_to_continue();
            }

            if step == Step::Halt {
                break;
            }
        }
    } else {
        loop {
            match machine.execute() {
                Ok(executed) => total_instructions += u64::from(executed),
                Err(e) => {
                    let VmError::IllegalInstruction { instructions, .. } = &e;
                    total_instructions += u64::from(*instructions);
                    println!("{e}");
                    if args.perf {
                        println!("total instructions executed: {total_instructions}");
                    }
                    std::process::exit(1);
                }
            }
            print!("{}", machine.host_mut().flush_output());
            if machine.host().halted() {
                break;
            }
        }
    }

    if args.perf {
        println!("total instructions executed: {total_instructions}");
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            println!("{e}");
            ExitCode::FAILURE
        }
    }
}
