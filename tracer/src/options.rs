//! Tracer configuration, recognized once at process init.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "memtracer")]
pub struct Options {
    #[arg(long, help = "Write per-thread trace files instead of an online pipe")]
    pub offline: bool,

    #[arg(long, default_value = "", help = "Parent directory for offline output")]
    pub outdir: String,

    #[arg(long, default_value = "", help = "Named-pipe identifier for online mode")]
    pub ipc_name: String,

    #[arg(long, help = "Translate virtual addresses in data entries before drain")]
    pub use_physical: bool,

    #[arg(long = "L0_filter", help = "Enable the inline direct-mapped cache filter")]
    pub l0_filter: bool,

    #[arg(
        long = "L0D_size",
        default_value_t = 32768,
        help = "Data-cache filter size in bytes"
    )]
    pub l0d_size: u64,

    #[arg(
        long = "L0I_size",
        default_value_t = 32768,
        help = "Instruction-cache filter size in bytes"
    )]
    pub l0i_size: u64,

    #[arg(long, default_value_t = 64, help = "Cache line size in bytes")]
    pub line_size: u64,

    #[arg(
        long,
        default_value_t = 0,
        help = "Cap total trace bytes emitted per thread (0 = unlimited)"
    )]
    pub max_trace_size: u64,

    #[arg(long, help = "Online mode emits distinct instruction-type entries")]
    pub online_instr_types: bool,

    #[arg(short, long, default_value_t = 0, help = "Logging verbosity")]
    pub verbose: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options::parse_from(["memtracer"])
    }
}
