use super::builder::*;
use super::*;

fn cec(center: bool) -> IterationSpace {
    IterationSpace::new(
        vec![LocationType::Cells, LocationType::Edges, LocationType::Cells],
        center,
    )
}

#[test]
fn test_chain_capacity_is_product_of_hop_degrees() {
    assert_eq!(cec(false).chain_capacity(), 6);
    assert_eq!(cec(false).table_size(), 6);
    assert_eq!(cec(true).table_size(), 7);

    let ce = IterationSpace::new(vec![LocationType::Cells, LocationType::Edges], false);
    assert_eq!(ce.chain_capacity(), 3);
    let ve = IterationSpace::new(vec![LocationType::Vertices, LocationType::Edges], false);
    assert_eq!(ve.chain_capacity(), 6);
    let ec = IterationSpace::new(vec![LocationType::Edges, LocationType::Cells], true);
    assert_eq!(ec.table_size(), 3);
}

#[test]
fn test_chain_without_hop_has_no_capacity() {
    let single = IterationSpace::new(vec![LocationType::Cells], false);
    assert_eq!(single.chain_capacity(), 0);
    assert_eq!(IterationSpace::new(vec![], true).table_size(), 1);
}

#[test]
fn test_space_names() {
    assert_eq!(cec(false).table_name(), "cecTable");
    assert_eq!(cec(true).table_name(), "cecWithCenterTable");
    assert_eq!(cec(false).size_name(), "CEC_SIZE");
    assert_eq!(cec(true).size_name(), "CEC_WITH_CENTER_SIZE");
    assert_eq!(cec(true).to_string(), "Cells -> Edges -> Cells (+center)");
}

#[test]
fn test_space_ordering_and_equality() {
    assert_eq!(cec(true), cec(true));
    assert_ne!(cec(true), cec(false));
    assert!(cec(false) < cec(true));
    let ce = IterationSpace::new(vec![LocationType::Cells, LocationType::Edges], false);
    assert!(ce < cec(false));
}

#[test]
fn test_location_order_matches_emission_order() {
    let mut locs = vec![
        LocationType::Vertices,
        LocationType::Cells,
        LocationType::Edges,
    ];
    locs.sort();
    assert_eq!(locs, LocationType::ALL.to_vec());
    assert_eq!(LocationType::Edges.stride_name(), "EdgeStride");
    assert_eq!(LocationType::Vertices.count_name(), "NumVertices");
}

#[test]
fn test_bound_render_and_eval() {
    assert_eq!(Bound::start(2).render("kSize"), "2");
    assert_eq!(Bound::absolute(3, -1).render("kSize"), "2");
    assert_eq!(Bound::end(-1).render("kSize"), "kSize + -1");
    assert_eq!(Bound::end(-1).eval(80), 79);
    assert_eq!(Bound::absolute(3, 1).eval(80), 4);
}

#[test]
fn test_interval_extent() {
    assert_eq!(Interval::full().extent("kSize_"), "kSize_ + 0 - 0");
    assert_eq!(Interval::full().extent_for(80), 80);

    let top = Interval::new(Bound::end(-2), Bound::end(0));
    assert_eq!(top.extent("kSize_"), "2");
    assert_eq!(top.extent_for(80), 2);

    let bottom = Interval::new(Bound::start(1), Bound::absolute(5, 0));
    assert_eq!(bottom.extent("kSize_"), "4");
    assert_eq!(bottom.extent_for(3), 4);

    let empty = Interval::new(Bound::start(10), Bound::start(4));
    assert_eq!(empty.extent_for(80), 0);
}

#[test]
fn test_same_levels_ignores_offsets() {
    let a = Interval::new(Bound::start(0), Bound::end(0));
    let b = Interval::new(Bound::start(1), Bound::end(-1));
    let c = Interval::new(Bound::end(-1), Bound::end(0));
    assert!(a.same_levels(&b));
    assert!(!a.same_levels(&c));
}

#[test]
fn test_field_dims() {
    let dense = FieldDims::dense(LocationType::Edges);
    assert_eq!(dense.rank(), 2);
    assert!(!dense.is_sparse());
    assert_eq!(dense.clone().horizontal_only().rank(), 1);

    let sparse = FieldDims::sparse(cec(true));
    assert!(sparse.is_sparse());
    assert_eq!(sparse.rank(), 3);
    assert_eq!(
        sparse.horizontal.as_ref().map(|h| h.sparse_size()),
        Some(7)
    );
    assert_eq!(
        sparse.horizontal.as_ref().and_then(|h| h.dense_location()),
        Some(LocationType::Cells)
    );

    assert!(FieldDims::vertical_only().is_vertical_only());
    assert_eq!(FieldDims::vertical_only().rank(), 1);
}

#[test]
fn test_builder_derives_intents() {
    let mut b = InstantiationBuilder::new("diffusion");
    let input = b.api_field("in", FieldDims::dense(LocationType::Cells));
    let out = b.api_field("out", FieldDims::dense(LocationType::Cells));
    let acc = b.api_field("acc", FieldDims::dense(LocationType::Cells));
    let unused = b.api_field("unused", FieldDims::dense(LocationType::Cells));
    b.multistage(
        LoopOrder::Parallel,
        vec![StageBuilder::new(LocationType::Cells).do_method(
            Interval::full(),
            vec![
                store(out, mul(at(input), lit(2.0))),
                Stmt::Assign {
                    target: LValue::Field(FieldAccess::center(acc)),
                    op: AssignOp::Add,
                    value: at(input),
                },
            ],
        )],
    );
    let inst = b.build();

    assert_eq!(inst.field(input).intent, Intent::Input);
    assert_eq!(inst.field(out).intent, Intent::Output);
    assert_eq!(inst.field(acc).intent, Intent::InputOutput);
    assert_eq!(inst.field(unused).intent, Intent::Input);

    let stage = &inst.stencils[0].multistages[0].stages[0];
    let ids: Vec<FieldId> = stage.ordered_fields().iter().map(|f| f.field).collect();
    assert_eq!(ids, vec![input, out, acc]);
}

#[test]
fn test_intent_merges_across_stages() {
    let mut b = InstantiationBuilder::new("two_stage");
    let tmp = b.temporary("tmp", FieldDims::dense(LocationType::Edges));
    let out = b.api_field("out", FieldDims::dense(LocationType::Edges));
    b.multistage(
        LoopOrder::Parallel,
        vec![
            StageBuilder::new(LocationType::Edges)
                .do_method(Interval::full(), vec![store(tmp, lit(1.0))]),
            StageBuilder::new(LocationType::Edges)
                .do_method(Interval::full(), vec![store(out, at(tmp))]),
        ],
    );
    let inst = b.build();
    assert_eq!(inst.field(tmp).intent, Intent::InputOutput);
    assert_eq!(inst.temporaries().collect::<Vec<_>>(), vec![tmp]);
    let stage_ids: Vec<usize> = inst.stencils[0].stages().map(|(_, s)| s.id).collect();
    assert_eq!(stage_ids, vec![0, 1]);
}

#[test]
fn test_instantiation_json_shape() {
    let mut b = InstantiationBuilder::new("copy");
    let input = b.api_field("in", FieldDims::dense(LocationType::Vertices));
    let out = b.api_field("out", FieldDims::dense(LocationType::Vertices));
    b.global("dt", GlobalType::Double);
    b.multistage(
        LoopOrder::Forward,
        vec![StageBuilder::new(LocationType::Vertices)
            .do_method(Interval::full(), vec![store(out, mul(at(input), global("dt")))])],
    );
    let inst = b.build();

    let json = serde_json::to_string(&inst).unwrap();
    assert!(json.contains("\"name\":\"copy\""));
    assert!(json.contains("\"Forward\""));
    let back: StencilInstantiation = serde_json::from_str(&json).unwrap();
    assert_eq!(back, inst);
}

#[test]
fn test_from_json_one_or_many() {
    let mut b = InstantiationBuilder::new("copy");
    let input = b.api_field("in", FieldDims::dense(LocationType::Cells));
    let out = b.api_field("out", FieldDims::dense(LocationType::Cells));
    b.multistage(
        LoopOrder::Parallel,
        vec![StageBuilder::new(LocationType::Cells)
            .do_method(Interval::full(), vec![store(out, at(input))])],
    );
    let inst = b.build();

    let one = serde_json::to_string(&inst).unwrap();
    assert_eq!(from_json(&one, "copy.json").unwrap(), vec![inst.clone()]);
    let many = serde_json::to_string(&vec![inst.clone(), inst.clone()]).unwrap();
    assert_eq!(from_json(&many, "copy.json").unwrap().len(), 2);
}

#[test]
fn test_from_json_rejects_bad_input() {
    let err = from_json("{\"name\": 3}", "bad.json").unwrap_err();
    assert!(err.message.starts_with("cannot parse 'bad.json'"));
    assert!(err.notes[0].starts_with("at line 1"));

    let mut b = InstantiationBuilder::new("dangling");
    let out = b.api_field("out", FieldDims::dense(LocationType::Cells));
    b.multistage(
        LoopOrder::Parallel,
        vec![StageBuilder::new(LocationType::Cells)
            .do_method(Interval::full(), vec![store(out, lit(1.0))])],
    );
    let mut inst = b.build();
    inst.stencils[0].multistages[0].stages[0].do_methods[0].body =
        vec![store(out, at(FieldId(5)))];
    let json = serde_json::to_string(&inst).unwrap();
    let err = from_json(&json, "dangling.json").unwrap_err();
    assert_eq!(err.message, "'dangling' refers to field 5 but has only 1 field(s)");
}

#[test]
fn test_load_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = load(&dir.path().join("missing.json")).unwrap_err();
    assert!(err.message.starts_with("cannot read '"));
}

fn scaled_copy(name: &str) -> StencilInstantiation {
    let mut b = InstantiationBuilder::new(name);
    let input = b.api_field("in", FieldDims::dense(LocationType::Cells));
    let out = b.api_field("out", FieldDims::dense(LocationType::Cells));
    b.api_field("unused", FieldDims::dense(LocationType::Edges));
    b.global("alpha", GlobalType::Double);
    b.global("beta", GlobalType::Integer);
    b.multistage(
        LoopOrder::Parallel,
        vec![StageBuilder::new(LocationType::Cells).do_method(
            Interval::full(),
            vec![store(out, mul(global("alpha"), at(input)))],
        )],
    );
    b.build()
}

#[test]
fn test_lint_collects_every_finding() {
    let diags = lint(&[scaled_copy("scale"), scaled_copy("scale")]);
    let messages: Vec<&str> = diags.iter().map(|d| d.message.as_str()).collect();
    assert_eq!(
        messages,
        vec![
            "API field 'unused' of 'scale' is never accessed",
            "global 'beta' of 'scale' is never read",
            "instantiation 'scale' is defined twice",
            "API field 'unused' of 'scale' is never accessed",
            "global 'beta' of 'scale' is never read",
        ]
    );
    assert_eq!(diags.iter().filter(|d| d.is_error()).count(), 1);
    assert_eq!(diags[1].help.as_deref(), Some("set_beta still gets generated"));
}

#[test]
fn test_lint_warns_on_empty_input() {
    let diags = lint(&[]);
    assert_eq!(diags.len(), 1);
    assert!(!diags[0].is_error());
    assert_eq!(diags[0].message, "no instantiations to generate");

    let mut b = InstantiationBuilder::new("clean");
    let out = b.api_field("out", FieldDims::dense(LocationType::Cells));
    b.multistage(
        LoopOrder::Parallel,
        vec![StageBuilder::new(LocationType::Cells)
            .do_method(Interval::full(), vec![store(out, lit(1.0))])],
    );
    assert!(lint(&[b.build()]).is_empty());
}

#[test]
fn test_lint_reports_dangling_field_instead_of_panicking() {
    let mut inst = scaled_copy("dangling");
    inst.api_fields.push(FieldId(9));
    let diags = lint(&[inst]);
    assert_eq!(diags.len(), 1);
    assert!(diags[0].is_error());
    assert!(diags[0].message.contains("refers to field 9"));
}
