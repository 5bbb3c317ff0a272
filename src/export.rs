use crate::heap::HeapGraph;
use std::io::Write;

/// Write every pointer between live objects as a `source,target` CSV row,
/// ordered by source address and slot. Returns the number of rows.
pub fn write_edges<W: Write>(graph: &HeapGraph, output: &mut W) -> std::io::Result<u64> {
    let mut sources: Vec<_> = graph.objects().collect();
    sources.sort_unstable_by_key(|(addr, _)| *addr);
    writeln!(output, "source,target")?;
    let mut rows = 0;
    for (addr, object) in sources {
        for (_, target) in object.targets() {
            if graph.is_live(target) {
                writeln!(output, "{},{}", addr, target.addr)?;
                rows += 1;
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{test_allocation, HeapGraphBuilder};
    use crate::trace::{Event, TracedEvent};

    #[test]
    fn test_edges_csv() {
        let mut builder = HeapGraphBuilder::new(false);
        let events = vec![
            Event::Allocate(test_allocation(0x20, 16)),
            Event::Allocate(test_allocation(0x10, 16)),
            Event::PointerUpdate { addr: 0x20, slot: 1, target: 0x10 },
            Event::PointerUpdate { addr: 0x10, slot: 0, target: 0x20 },
            Event::PointerUpdate { addr: 0x10, slot: 1, target: 0x10 },
            // never allocated, left out
            Event::PointerUpdate { addr: 0x20, slot: 0, target: 0x30 },
        ];
        for (offset, event) in events.into_iter().enumerate() {
            builder
                .apply(&TracedEvent {
                    offset: offset as u64,
                    event,
                })
                .unwrap();
        }
        let mut out = vec![];
        let rows = write_edges(builder.graph(), &mut out).unwrap();
        assert_eq!(rows, 3);
        assert_eq!(String::from_utf8(out).unwrap(), "source,target\n16,32\n16,16\n32,16\n");
    }
}
