// build.rs

fn main() -> anyhow::Result<()> {
    let _ = build_data::set_BUILD_DATE();
    let _ = build_data::set_BUILD_TIME();
    let _ = build_data::no_debug_rebuilds();

    // only does something when building for espidf
    embuild::espidf::sysenv::output();
    Ok(())
}
// EOF
