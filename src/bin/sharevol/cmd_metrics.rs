use ShareVol::metrics;

/// Counters of this process, one `name value` pair per line.
pub fn print() {
    let m = metrics::snapshot();
    println!("metrics:");
    println!("  snapshots_created      {}", m.snapshots_created);
    println!("  snapshots_deleted      {}", m.snapshots_deleted);
    println!("  snapshot_delete_noops  {}", m.snapshot_delete_noops);
    println!("  chain_commits          {}", m.chain_commits);
    println!("  chain_rebases          {}", m.chain_rebases);
    println!("  chain_walks            {}", m.chain_walks);
    println!("  avg_chain_len          {:.2}", m.avg_chain_len());
    println!("  share_selections       {}", m.share_selections);
    println!("  share_rejections       {}", m.share_rejections);
    println!("  cache_hits             {}", m.cache_hits);
    println!("  cache_conversions      {}", m.cache_conversions);
    println!("  cache_fetches          {}", m.cache_fetches);
    println!("  cache_reuse_ratio      {:.2}", m.cache_reuse_ratio());
    println!("  image_resizes          {}", m.image_resizes);
}
