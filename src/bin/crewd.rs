//! crew daemon entry point. See [`crewd::cli`].

fn main() -> anyhow::Result<()> {
    crewd::cli::main()
}
