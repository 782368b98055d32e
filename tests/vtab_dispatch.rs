use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char, c_void};
use std::ptr::{NonNull, null, null_mut};
use std::sync::atomic::{AtomicUsize, Ordering};

use sqlite_vtab_provider::*;

#[derive(Clone, Debug, PartialEq)]
enum MockValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Unrecognized(i32),
}

#[derive(Clone, Debug, PartialEq)]
enum MockResult {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Error(String),
}

struct MockContext {
    user_data: *mut c_void,
    result: Option<MockResult>,
    error_code: Option<i32>,
}

impl MockContext {
    fn new(user_data: *mut c_void) -> Self {
        Self {
            user_data,
            result: None,
            error_code: None,
        }
    }
}

struct ModuleRegistration {
    name: String,
    module: &'static sqlite3_module<MockApi>,
    user_data: *mut c_void,
    drop_user_data: Option<extern "C" fn(*mut c_void)>,
}

#[derive(Default)]
struct MockDb {
    modules: RefCell<Vec<ModuleRegistration>>,
    declared: RefCell<Vec<String>>,
    overloads: RefCell<Vec<(String, i32)>>,
}

struct MockApi {
    features: FeatureSet,
    version: Option<ApiVersion>,
    mallocs: AtomicUsize,
    frees: AtomicUsize,
    value_reads: AtomicUsize,
}

impl MockApi {
    fn new(features: FeatureSet) -> Self {
        Self {
            features,
            version: None,
            mallocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            value_reads: AtomicUsize::new(0),
        }
    }

    fn full() -> Self {
        Self::new(
            FeatureSet::VIRTUAL_TABLES | FeatureSet::CREATE_FUNCTION_V2 | FeatureSet::OVERLOAD_FUNCTION,
        )
    }

    fn outstanding(&self) -> usize {
        self.mallocs.load(Ordering::SeqCst) - self.frees.load(Ordering::SeqCst)
    }

    fn free_count(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    fn reads(&self) -> usize {
        self.value_reads.load(Ordering::SeqCst)
    }

    fn read<'a>(&self, v: NonNull<MockValue>) -> &'a MockValue {
        self.value_reads.fetch_add(1, Ordering::SeqCst);
        unsafe { &*v.as_ptr() }
    }

    fn set(ctx: NonNull<MockContext>, result: MockResult) {
        unsafe { (*ctx.as_ptr()).result = Some(result) };
    }
}

unsafe impl Sqlite3Api for MockApi {
    type Db = MockDb;
    type Value = MockValue;
    type Context = MockContext;

    fn api_version(&self) -> ApiVersion {
        ApiVersion::new(3, 45, 0)
    }

    fn feature_set(&self) -> FeatureSet {
        self.features
    }

    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn backend_version(&self) -> Option<ApiVersion> {
        self.version
    }

    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        self.mallocs.fetch_add(1, Ordering::SeqCst);
        unsafe { libc::malloc(size) }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        if !ptr.is_null() {
            self.frees.fetch_add(1, Ordering::SeqCst);
            unsafe { libc::free(ptr) };
        }
    }

    unsafe fn open(&self, _filename: &str, _options: OpenOptions<'_>) -> Result<NonNull<MockDb>> {
        Ok(NonNull::from(Box::leak(Box::new(MockDb::default()))))
    }

    unsafe fn close(&self, db: NonNull<MockDb>) -> Result<()> {
        let db = unsafe { Box::from_raw(db.as_ptr()) };
        for registration in db.modules.borrow_mut().drain(..) {
            if let Some(drop_user_data) = registration.drop_user_data {
                drop_user_data(registration.user_data);
            }
        }
        Ok(())
    }

    unsafe fn create_function_v2(
        &self,
        _db: NonNull<MockDb>,
        _name: &str,
        _n_args: i32,
        _flags: FunctionFlags,
        _x_func: Option<ScalarCallback<Self>>,
        user_data: *mut c_void,
        drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()> {
        if let Some(drop_user_data) = drop_user_data {
            drop_user_data(user_data);
        }
        Err(Error::feature_unavailable("mock has no function registry"))
    }

    unsafe fn overload_function(&self, db: NonNull<MockDb>, name: &str, n_args: i32) -> Result<()> {
        unsafe { db.as_ref() }
            .overloads
            .borrow_mut()
            .push((name.to_owned(), n_args));
        Ok(())
    }

    unsafe fn result_null(&self, ctx: NonNull<MockContext>) {
        Self::set(ctx, MockResult::Null);
    }

    unsafe fn result_int64(&self, ctx: NonNull<MockContext>, v: i64) {
        Self::set(ctx, MockResult::Integer(v));
    }

    unsafe fn result_double(&self, ctx: NonNull<MockContext>, v: f64) {
        Self::set(ctx, MockResult::Float(v));
    }

    unsafe fn result_text(&self, ctx: NonNull<MockContext>, v: &str) {
        Self::set(ctx, MockResult::Text(v.to_owned()));
    }

    unsafe fn result_blob(&self, ctx: NonNull<MockContext>, v: &[u8]) {
        Self::set(ctx, MockResult::Blob(v.to_vec()));
    }

    unsafe fn result_zeroblob(&self, ctx: NonNull<MockContext>, n: i32) {
        Self::set(ctx, MockResult::Blob(vec![0; n.max(0) as usize]));
    }

    unsafe fn result_error(&self, ctx: NonNull<MockContext>, msg: &str) {
        Self::set(ctx, MockResult::Error(msg.to_owned()));
    }

    unsafe fn result_error_code(&self, ctx: NonNull<MockContext>, code: i32) {
        unsafe { (*ctx.as_ptr()).error_code = Some(code) };
    }

    unsafe fn result_value(&self, ctx: NonNull<MockContext>, v: NonNull<MockValue>) {
        let result = match self.read(v) {
            MockValue::Null | MockValue::Unrecognized(_) => MockResult::Null,
            MockValue::Integer(i) => MockResult::Integer(*i),
            MockValue::Float(f) => MockResult::Float(*f),
            MockValue::Text(s) => MockResult::Text(s.clone()),
            MockValue::Blob(b) => MockResult::Blob(b.clone()),
        };
        Self::set(ctx, result);
    }

    unsafe fn user_data(ctx: NonNull<MockContext>) -> *mut c_void {
        unsafe { ctx.as_ref() }.user_data
    }

    unsafe fn value_type(&self, v: NonNull<MockValue>) -> ValueType {
        match self.read(v) {
            MockValue::Null => ValueType::Null,
            MockValue::Integer(_) => ValueType::Integer,
            MockValue::Float(_) => ValueType::Float,
            MockValue::Text(_) => ValueType::Text,
            MockValue::Blob(_) => ValueType::Blob,
            MockValue::Unrecognized(code) => ValueType::from_code(*code),
        }
    }

    unsafe fn value_int64(&self, v: NonNull<MockValue>) -> i64 {
        match self.read(v) {
            MockValue::Integer(i) => *i,
            MockValue::Float(f) => *f as i64,
            _ => 0,
        }
    }

    unsafe fn value_double(&self, v: NonNull<MockValue>) -> f64 {
        match self.read(v) {
            MockValue::Integer(i) => *i as f64,
            MockValue::Float(f) => *f,
            _ => 0.0,
        }
    }

    unsafe fn value_text(&self, v: NonNull<MockValue>) -> RawBytes {
        match self.read(v) {
            MockValue::Text(s) => RawBytes {
                ptr: s.as_ptr(),
                len: s.len(),
            },
            _ => RawBytes::empty(),
        }
    }

    unsafe fn value_blob(&self, v: NonNull<MockValue>) -> RawBytes {
        match self.read(v) {
            MockValue::Blob(b) => RawBytes {
                ptr: b.as_ptr(),
                len: b.len(),
            },
            MockValue::Text(s) => RawBytes {
                ptr: s.as_ptr(),
                len: s.len(),
            },
            _ => RawBytes::empty(),
        }
    }

    unsafe fn value_bytes(&self, v: NonNull<MockValue>) -> i32 {
        unsafe { self.value_blob(v) }.len as i32
    }

    unsafe fn declare_vtab(&self, db: NonNull<MockDb>, schema: &str) -> Result<()> {
        unsafe { db.as_ref() }
            .declared
            .borrow_mut()
            .push(schema.to_owned());
        Ok(())
    }

    unsafe fn create_module_v2(
        &self,
        db: NonNull<MockDb>,
        name: &str,
        module: &'static sqlite3_module<Self>,
        user_data: *mut c_void,
        drop_user_data: Option<extern "C" fn(*mut c_void)>,
    ) -> Result<()> {
        unsafe { db.as_ref() }
            .modules
            .borrow_mut()
            .push(ModuleRegistration {
                name: name.to_owned(),
                module,
                user_data,
                drop_user_data,
            });
        Ok(())
    }
}

fn open(api: &MockApi) -> Connection<'_, MockApi> {
    let options = OpenOptions {
        flags: OpenFlags::READ_WRITE | OpenFlags::CREATE,
        vfs: None,
    };
    Connection::open(api, ":memory:", options).expect("open")
}

type Constructor = extern "C" fn(
    *mut MockDb,
    *mut c_void,
    i32,
    *const *const u8,
    *mut *mut sqlite3_vtab,
    *mut *mut u8,
) -> i32;

/// Drives registered callbacks the way the engine would.
struct Engine {
    db: NonNull<MockDb>,
    module: &'static sqlite3_module<MockApi>,
    aux: *mut c_void,
}

impl Engine {
    fn attach(conn: &Connection<'_, MockApi>, name: &str) -> Self {
        let db = conn.raw_handle();
        let modules = unsafe { db.as_ref() }.modules.borrow();
        let registration = modules
            .iter()
            .rev()
            .find(|registration| registration.name == name)
            .expect("module registered");
        Self {
            db,
            module: registration.module,
            aux: registration.user_data,
        }
    }

    fn host<M: Module<MockApi>>(&self) -> &ModuleHost<MockApi, M> {
        unsafe { &*(self.aux as *const ModuleHost<MockApi, M>) }
    }

    fn declared(&self) -> Vec<String> {
        unsafe { self.db.as_ref() }.declared.borrow().clone()
    }

    fn create(&self, api: &MockApi, args: &[&str]) -> core::result::Result<*mut sqlite3_vtab, (i32, String)> {
        self.construct(api, args, self.module.x_create.expect("x_create"))
    }

    fn connect(&self, api: &MockApi, args: &[&str]) -> core::result::Result<*mut sqlite3_vtab, (i32, String)> {
        self.construct(api, args, self.module.x_connect.expect("x_connect"))
    }

    fn construct(
        &self,
        api: &MockApi,
        args: &[&str],
        constructor: Constructor,
    ) -> core::result::Result<*mut sqlite3_vtab, (i32, String)> {
        let owned: Vec<CString> = args.iter().map(|arg| CString::new(*arg).expect("arg")).collect();
        let argv: Vec<*const u8> = owned.iter().map(|arg| arg.as_ptr() as *const u8).collect();
        let mut vtab = null_mut();
        let mut err: *mut u8 = null_mut();
        let rc = constructor(
            self.db.as_ptr(),
            self.aux,
            argv.len() as i32,
            argv.as_ptr(),
            &mut vtab,
            &mut err,
        );
        if rc == 0 {
            return Ok(vtab);
        }
        let message = if err.is_null() {
            String::new()
        } else {
            let text = unsafe { CStr::from_ptr(err as *const c_char) }
                .to_string_lossy()
                .into_owned();
            unsafe { api.free(err as *mut c_void) };
            text
        };
        Err((rc, message))
    }

    fn open(&self, vtab: *mut sqlite3_vtab) -> *mut sqlite3_vtab_cursor {
        let mut cursor = null_mut();
        let rc = self.module.x_open.expect("x_open")(vtab, &mut cursor);
        assert_eq!(rc, 0, "open failed: {:?}", table_error(vtab));
        cursor
    }

    fn scan(&self, cursor: *mut sqlite3_vtab_cursor) -> Vec<(i64, MockResult)> {
        let mut rows = Vec::new();
        while self.module.x_eof.expect("x_eof")(cursor) == 0 {
            let mut ctx = MockContext::new(null_mut());
            assert_eq!(self.module.x_column.expect("x_column")(cursor, &mut ctx, 0), 0);
            let mut rowid = 0;
            assert_eq!(self.module.x_rowid.expect("x_rowid")(cursor, &mut rowid), 0);
            rows.push((rowid, ctx.result.expect("column result")));
            assert_eq!(self.module.x_next.expect("x_next")(cursor), 0);
        }
        rows
    }
}

fn table_error(vtab: *mut sqlite3_vtab) -> Option<String> {
    let message = unsafe { (*vtab).z_err_msg };
    if message.is_null() {
        return None;
    }
    Some(
        unsafe { CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned(),
    )
}

fn letters() -> SequenceModule {
    SequenceModule::new(vec!["a".into(), "b".into(), "c".into()])
}

#[test]
fn sequence_scan_end_to_end() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module("seq", letters()).expect("register");
    let engine = Engine::attach(&conn, "seq");
    assert_eq!(engine.module.i_version, 2);

    let vtab = engine
        .create(&api, &["seq", "main", "letters"])
        .expect("create");
    assert_eq!(engine.declared(), vec!["CREATE TABLE x(value)".to_owned()]);
    assert_eq!(engine.host::<SequenceModule>().table_count(), 1);

    let caps = IndexCapabilities::from_version(api.api_version());
    let info = NativeIndexInfo::new(&api, caps, &IndexNegotiation::new(Vec::new(), Vec::new()))
        .expect("index info");
    assert_eq!(engine.module.x_best_index.expect("x_best_index")(vtab, info.as_ptr()), 0);
    let planned = unsafe { IndexNegotiation::from_native(caps, info.as_ptr(), true) }.expect("read");
    assert_eq!(planned.outputs.estimated_rows, Some(3));
    assert_eq!(planned.outputs.estimated_cost, Some(3.0));
    drop(info);

    let cursor = engine.open(vtab);
    assert_eq!(engine.host::<SequenceModule>().cursor_count(), 1);
    let rc = engine.module.x_filter.expect("x_filter")(cursor, 0, null(), 0, null_mut());
    assert_eq!(rc, 0);
    assert_eq!(
        engine.scan(cursor),
        vec![
            (1, MockResult::Text("a".into())),
            (2, MockResult::Text("b".into())),
            (3, MockResult::Text("c".into())),
        ]
    );

    assert_eq!(engine.module.x_close.expect("x_close")(cursor), 0);
    assert_eq!(engine.host::<SequenceModule>().cursor_count(), 0);
    assert_eq!(engine.module.x_disconnect.expect("x_disconnect")(vtab), 0);
    assert_eq!(engine.host::<SequenceModule>().table_count(), 0);

    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn update_without_override_is_read_only() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module("seq", letters()).expect("register");
    let engine = Engine::attach(&conn, "seq");
    let vtab = engine.create(&api, &["seq", "main", "frozen"]).expect("create");

    let x_update = engine.module.x_update.expect("x_update");
    let mut argv = [null_mut::<MockValue>()];
    let mut rowid = 0;
    assert_eq!(x_update(vtab, 1, argv.as_mut_ptr(), &mut rowid), 1);
    let message = table_error(vtab).expect("error message");
    assert!(message.contains("frozen"), "{message}");
    assert!(message.contains("read-only"), "{message}");

    let outstanding = api.outstanding();
    assert_eq!(x_update(vtab, 1, argv.as_mut_ptr(), &mut rowid), 1);
    assert_eq!(api.outstanding(), outstanding);

    assert_eq!(engine.module.x_destroy.expect("x_destroy")(vtab), 0);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[derive(Default)]
struct Flaky {
    panic_in_filter: bool,
}

impl Module<MockApi> for Flaky {
    type Table = Vec<Value>;
    type Cursor = ();

    fn create(
        &mut self,
        conn: &VTabConnection<'_, MockApi>,
        args: &[String],
    ) -> Result<(String, Vec<Value>)> {
        if args.iter().any(|arg| arg == "reject") {
            return Err(Error::with_message(ErrorCode::Error, "rejected by module"));
        }
        conn.declare_function(1, "tag")?;
        Ok(("CREATE TABLE x(v)".to_owned(), Vec::new()))
    }

    fn destroy(&mut self, _table: &mut VirtualTable<Vec<Value>>) -> Result<()> {
        Err(Error::with_message(ErrorCode::Busy, "still busy"))
    }

    fn open(&mut self, _table: &mut VirtualTable<Vec<Value>>) -> Result<()> {
        Ok(())
    }

    fn filter(
        &mut self,
        _table: &VirtualTable<Vec<Value>>,
        cursor: &mut VirtualTableCursor<()>,
        index_number: i32,
        index_string: Option<&str>,
        args: &mut [NativeValue<'_, MockApi>],
    ) -> Result<()> {
        if self.panic_in_filter {
            panic!("filter exploded");
        }
        cursor.filter(index_number, index_string, args)
    }

    fn next(&mut self, _table: &VirtualTable<Vec<Value>>, cursor: &mut VirtualTableCursor<()>) -> Result<()> {
        cursor.next_row_index();
        Ok(())
    }

    fn eof(&mut self, _table: &VirtualTable<Vec<Value>>, _cursor: &mut VirtualTableCursor<()>) -> Result<bool> {
        Ok(true)
    }

    fn column(
        &mut self,
        _table: &VirtualTable<Vec<Value>>,
        _cursor: &mut VirtualTableCursor<()>,
        ctx: &Context<'_, MockApi>,
        _column: i32,
    ) -> Result<()> {
        ctx.set_null()
    }

    fn row_id(&mut self, _table: &VirtualTable<Vec<Value>>, cursor: &mut VirtualTableCursor<()>) -> Result<i64> {
        Ok(cursor.row_index())
    }

    fn update(
        &mut self,
        table: &mut VirtualTable<Vec<Value>>,
        values: &mut [NativeValue<'_, MockApi>],
    ) -> Result<Option<i64>> {
        for value in values.iter_mut() {
            if !value.persist() {
                return Err(Error::with_message(ErrorCode::Mismatch, "unsupported value"));
            }
            table.state_mut().push(value.value()?.clone());
        }
        Ok(Some(table.state().len() as i64))
    }

    fn find_function(
        &mut self,
        table: &mut VirtualTable<Vec<Value>>,
        n_args: i32,
        name: &str,
    ) -> Option<VTabFunction<MockApi>> {
        if n_args != 1 || name != "tag" {
            return None;
        }
        let owner = table.table_name().unwrap_or_default().to_owned();
        Some(Box::new(move |_ctx: &Context<'_, MockApi>, args: &[ValueRef<'_>]| {
            let arg = args.first().and_then(|arg| arg.as_str()).unwrap_or_default();
            Ok(Value::Text(format!("tagged:{arg}@{owner}")))
        }))
    }
}

#[test]
fn create_failure_reports_through_out_err() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module("flaky", Flaky::default()).expect("register");
    let engine = Engine::attach(&conn, "flaky");
    let (rc, message) = engine
        .create(&api, &["flaky", "main", "t", "reject"])
        .expect_err("rejected");
    assert_eq!(rc, 1);
    assert_eq!(message, "rejected by module");
    assert_eq!(engine.host::<Flaky>().table_count(), 0);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn destroy_failure_still_unregisters_and_frees() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module("flaky", Flaky::default()).expect("register");
    let engine = Engine::attach(&conn, "flaky");
    let vtab = engine.create(&api, &["flaky", "main", "t"]).expect("create");
    assert_eq!(
        unsafe { conn.raw_handle().as_ref() }.overloads.borrow().as_slice(),
        &[("tag".to_owned(), 1)]
    );

    let frees = api.free_count();
    assert_eq!(engine.module.x_destroy.expect("x_destroy")(vtab), 5);
    assert_eq!(api.free_count(), frees + 1);
    assert_eq!(engine.host::<Flaky>().table_count(), 0);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn panics_become_table_errors() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module(
        "flaky",
        Flaky {
            panic_in_filter: true,
        },
    )
    .expect("register");
    let engine = Engine::attach(&conn, "flaky");
    let vtab = engine.create(&api, &["flaky", "main", "t"]).expect("create");
    let cursor = engine.open(vtab);
    let rc = engine.module.x_filter.expect("x_filter")(cursor, 0, null(), 0, null_mut());
    assert_eq!(rc, 1);
    assert_eq!(
        table_error(vtab).as_deref(),
        Some("panic in virtual table module \"flaky\": filter exploded")
    );

    assert_eq!(engine.module.x_close.expect("x_close")(cursor), 0);
    assert_eq!(engine.module.x_disconnect.expect("x_disconnect")(vtab), 0);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn unresolvable_cursor_reads_as_end_of_rows() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module("seq", letters()).expect("register");
    let engine = Engine::attach(&conn, "seq");
    let vtab = engine.create(&api, &["seq", "main", "t"]).expect("create");

    let mut stray = sqlite3_vtab_cursor { p_vtab: vtab };
    assert_eq!(engine.module.x_eof.expect("x_eof")(&mut stray), 1);
    assert_eq!(engine.module.x_next.expect("x_next")(&mut stray), 1);
    let message = table_error(vtab).expect("error message");
    assert!(message.contains("not found"), "{message}");

    assert_eq!(engine.module.x_disconnect.expect("x_disconnect")(vtab), 0);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn update_persists_values_and_returns_rowid() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module("flaky", Flaky::default()).expect("register");
    let engine = Engine::attach(&conn, "flaky");
    let vtab = engine.create(&api, &["flaky", "main", "t"]).expect("create");

    let mut values = [
        MockValue::Null,
        MockValue::Integer(7),
        MockValue::Float(0.5),
        MockValue::Blob(vec![9]),
    ];
    let mut argv: Vec<*mut MockValue> = values.iter_mut().map(|v| v as *mut MockValue).collect();
    let mut rowid = 0;
    let x_update = engine.module.x_update.expect("x_update");
    assert_eq!(x_update(vtab, argv.len() as i32, argv.as_mut_ptr(), &mut rowid), 0);
    assert_eq!(rowid, 4);

    let handle = NativeHandle::from_ptr(vtab);
    let table = engine.host::<Flaky>().table(handle).expect("registered");
    assert_eq!(
        table.state().as_slice(),
        &[Value::Null, Value::Integer(7), Value::Float(0.5), Value::Blob(vec![9])]
    );

    let reads = api.reads();
    let mut odd = [MockValue::Unrecognized(42)];
    let mut odd_argv: Vec<*mut MockValue> = odd.iter_mut().map(|v| v as *mut MockValue).collect();
    assert_eq!(x_update(vtab, 1, odd_argv.as_mut_ptr(), &mut rowid), 20);
    assert!(api.reads() > reads);
    assert_eq!(table_error(vtab).as_deref(), Some("unsupported value"));

    assert_eq!(engine.module.x_disconnect.expect("x_disconnect")(vtab), 0);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn find_function_hands_back_a_callable_overload() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module("flaky", Flaky::default()).expect("register");
    let engine = Engine::attach(&conn, "flaky");
    let vtab = engine.create(&api, &["flaky", "main", "t"]).expect("create");
    let x_find_function = engine.module.x_find_function.expect("x_find_function");

    let mut func: Option<ScalarCallback<MockApi>> = None;
    let mut arg = null_mut();
    assert_eq!(x_find_function(vtab, 1, c"tag".as_ptr() as *const u8, &mut func, &mut arg), 1);
    let func = func.expect("overload");
    assert!(!arg.is_null());

    let mut value = MockValue::Text("x".into());
    let mut argv = [&mut value as *mut MockValue];
    let mut ctx = MockContext::new(arg);
    func(&mut ctx, 1, argv.as_mut_ptr());
    assert_eq!(ctx.result, Some(MockResult::Text("tagged:x@t".into())));

    let mut again = None;
    let mut again_arg = null_mut();
    assert_eq!(
        x_find_function(vtab, 1, c"tag".as_ptr() as *const u8, &mut again, &mut again_arg),
        1
    );
    assert_eq!(again_arg, arg);
    assert_eq!(engine.host::<Flaky>().function_count(), 1);

    let mut missing = None;
    assert_eq!(
        x_find_function(vtab, 2, c"tag".as_ptr() as *const u8, &mut missing, &mut again_arg),
        0
    );
    assert!(missing.is_none());

    assert_eq!(engine.module.x_disconnect.expect("x_disconnect")(vtab), 0);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn forwarding_without_implementation_reports_unavailable() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_native_module("fwd", ForwardingModule::new(&api, None), 2)
        .expect("register");
    let engine = Engine::attach(&conn, "fwd");
    let (rc, message) = engine.create(&api, &["fwd", "main", "t"]).expect_err("unavailable");
    assert_eq!(rc, 1);
    assert_eq!(message, "native module implementation not available");
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn forwarding_delegates_to_installed_implementation() {
    let api = MockApi::full();
    let conn = open(&api);
    let host = ModuleHost::new(&api, "seq", letters(), ModuleOptions::default());
    conn.create_native_module("fwd", ForwardingModule::new(&api, Some(Box::new(host))), 2)
        .expect("register");
    let engine = Engine::attach(&conn, "fwd");
    let vtab = engine.create(&api, &["fwd", "main", "t"]).expect("create");
    let cursor = engine.open(vtab);
    assert_eq!(engine.module.x_filter.expect("x_filter")(cursor, 0, null(), 0, null_mut()), 0);
    assert_eq!(engine.scan(cursor).len(), 3);
    assert_eq!(engine.module.x_close.expect("x_close")(cursor), 0);
    assert_eq!(engine.module.x_disconnect.expect("x_disconnect")(vtab), 0);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn module_version_one_leaves_savepoints_empty() {
    let api = MockApi::full();
    let conn = open(&api);
    let options = ModuleOptions {
        module_version: 1,
        ..ModuleOptions::default()
    };
    conn.create_module_with_options("seq", letters(), options)
        .expect("register");
    let engine = Engine::attach(&conn, "seq");
    assert_eq!(engine.module.i_version, 1);
    assert!(engine.module.x_savepoint.is_none());
    assert!(engine.module.x_release.is_none());
    assert!(engine.module.x_rollback_to.is_none());
    assert!(engine.module.x_rename.is_some());
}

#[test]
fn rename_updates_table_name() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module("seq", letters()).expect("register");
    let engine = Engine::attach(&conn, "seq");
    let vtab = engine.create(&api, &["seq", "main", "old"]).expect("create");
    assert_eq!(engine.module.x_rename.expect("x_rename")(vtab, c"new".as_ptr() as *const u8), 0);
    let table = engine
        .host::<SequenceModule>()
        .table(NativeHandle::from_ptr(vtab))
        .expect("registered");
    assert_eq!(table.table_name(), Some("new"));
    assert_eq!(engine.module.x_savepoint.expect("x_savepoint")(vtab, 0), 0);
    assert_eq!(engine.module.x_disconnect.expect("x_disconnect")(vtab), 0);
}

#[test]
fn virtual_tables_require_feature() {
    let api = MockApi::new(FeatureSet::CREATE_FUNCTION_V2);
    let conn = open(&api);
    let err = conn.create_module("seq", letters()).expect_err("unsupported");
    assert_eq!(err.code, ErrorCode::FeatureUnavailable);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn find_function_overloads_stay_bound_to_their_table() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module("flaky", Flaky::default()).expect("register");
    let engine = Engine::attach(&conn, "flaky");
    let first = engine.create(&api, &["flaky", "main", "ta"]).expect("create ta");
    let second = engine.create(&api, &["flaky", "main", "tb"]).expect("create tb");
    let x_find_function = engine.module.x_find_function.expect("x_find_function");

    let lookup = |vtab: *mut sqlite3_vtab| {
        let mut func: Option<ScalarCallback<MockApi>> = None;
        let mut arg = null_mut();
        assert_eq!(x_find_function(vtab, 1, c"tag".as_ptr() as *const u8, &mut func, &mut arg), 1);
        (func.expect("overload"), arg)
    };
    let (first_func, first_arg) = lookup(first);
    let (second_func, second_arg) = lookup(second);
    assert_ne!(first_arg, second_arg);
    assert_eq!(lookup(first).1, first_arg);
    assert_eq!(engine.host::<Flaky>().function_count(), 2);

    let call = |func: ScalarCallback<MockApi>, arg: *mut c_void| {
        let mut value = MockValue::Text("v".into());
        let mut argv = [&mut value as *mut MockValue];
        let mut ctx = MockContext::new(arg);
        func(&mut ctx, 1, argv.as_mut_ptr());
        ctx.result
    };
    assert_eq!(call(first_func, first_arg), Some(MockResult::Text("tagged:v@ta".into())));
    assert_eq!(call(second_func, second_arg), Some(MockResult::Text("tagged:v@tb".into())));

    assert_eq!(engine.module.x_disconnect.expect("x_disconnect")(first), 0);
    assert_eq!(engine.host::<Flaky>().function_count(), 1);
    assert_eq!(call(second_func, second_arg), Some(MockResult::Text("tagged:v@tb".into())));
    assert_eq!(engine.module.x_disconnect.expect("x_disconnect")(second), 0);
    assert_eq!(engine.host::<Flaky>().function_count(), 0);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn module_version_outside_struct_layout_is_rejected() {
    let api = MockApi::full();
    let conn = open(&api);
    for module_version in [0, 3, 4] {
        let options = ModuleOptions {
            module_version,
            ..ModuleOptions::default()
        };
        let err = conn
            .create_module_with_options("seq", letters(), options)
            .expect_err("unsupported version");
        assert_eq!(err.code, ErrorCode::Misuse);
    }
    assert!(unsafe { conn.raw_handle().as_ref() }.modules.borrow().is_empty());

    let clamped = native_module_table::<MockApi, ForwardingModule<MockApi>>(3);
    assert_eq!(clamped.i_version, MAX_MODULE_VERSION);
    assert!(clamped.x_rollback_to.is_some());
    let floor = native_module_table::<MockApi, ForwardingModule<MockApi>>(-1);
    assert_eq!(floor.i_version, 1);
    assert!(floor.x_savepoint.is_none());
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

/// Module that plans equality lookups on column 0 and records every
/// transaction callback in its table state.
struct Keyed;

const KEYED_PLAN: i32 = 7;

impl Module<MockApi> for Keyed {
    type Table = Vec<String>;
    type Cursor = ();

    fn create(
        &mut self,
        _conn: &VTabConnection<'_, MockApi>,
        _args: &[String],
    ) -> Result<(String, Vec<String>)> {
        Ok(("CREATE TABLE x(k, v)".to_owned(), vec!["created".to_owned()]))
    }

    fn connect(
        &mut self,
        _conn: &VTabConnection<'_, MockApi>,
        _args: &[String],
    ) -> Result<(String, Vec<String>)> {
        Ok(("CREATE TABLE x(k, v)".to_owned(), vec!["connected".to_owned()]))
    }

    fn best_index(
        &mut self,
        table: &mut VirtualTable<Vec<String>>,
        index: &mut IndexNegotiation,
    ) -> Result<()> {
        let mut next_argv = 1;
        for (constraint, usage) in index
            .inputs
            .constraints
            .iter()
            .zip(index.outputs.constraint_usages.iter_mut())
        {
            if constraint.usable && constraint.column == 0 && constraint.op == IndexConstraintOp::Eq {
                usage.argv_index = next_argv;
                usage.omit = true;
                next_argv += 1;
            }
        }
        index.outputs.index_number = KEYED_PLAN;
        index.outputs.index_string = Some("by-key".to_owned());
        index.outputs.estimated_cost = Some(1.0);
        table.best_index(index);
        Ok(())
    }

    fn open(&mut self, _table: &mut VirtualTable<Vec<String>>) -> Result<()> {
        Ok(())
    }

    fn filter(
        &mut self,
        _table: &VirtualTable<Vec<String>>,
        cursor: &mut VirtualTableCursor<()>,
        index_number: i32,
        index_string: Option<&str>,
        args: &mut [NativeValue<'_, MockApi>],
    ) -> Result<()> {
        cursor.filter(index_number, index_string, args)?;
        cursor.next_row_index();
        Ok(())
    }

    fn next(&mut self, _table: &VirtualTable<Vec<String>>, cursor: &mut VirtualTableCursor<()>) -> Result<()> {
        cursor.next_row_index();
        Ok(())
    }

    fn eof(&mut self, _table: &VirtualTable<Vec<String>>, cursor: &mut VirtualTableCursor<()>) -> Result<bool> {
        Ok(cursor.row_index() != 1)
    }

    fn column(
        &mut self,
        _table: &VirtualTable<Vec<String>>,
        cursor: &mut VirtualTableCursor<()>,
        ctx: &Context<'_, MockApi>,
        _column: i32,
    ) -> Result<()> {
        match cursor.values().first() {
            Some(Value::Integer(key)) => ctx.set_int64(*key),
            _ => ctx.set_null(),
        }
    }

    fn row_id(&mut self, _table: &VirtualTable<Vec<String>>, cursor: &mut VirtualTableCursor<()>) -> Result<i64> {
        Ok(cursor.row_index())
    }

    fn begin(&mut self, table: &mut VirtualTable<Vec<String>>) -> Result<()> {
        table.state_mut().push("begin".to_owned());
        Ok(())
    }

    fn sync(&mut self, table: &mut VirtualTable<Vec<String>>) -> Result<()> {
        table.state_mut().push("sync".to_owned());
        Ok(())
    }

    fn commit(&mut self, table: &mut VirtualTable<Vec<String>>) -> Result<()> {
        table.state_mut().push("commit".to_owned());
        Ok(())
    }

    fn rollback(&mut self, table: &mut VirtualTable<Vec<String>>) -> Result<()> {
        table.state_mut().push("rollback".to_owned());
        Ok(())
    }

    fn savepoint(&mut self, table: &mut VirtualTable<Vec<String>>, savepoint: i32) -> Result<()> {
        table.state_mut().push(format!("savepoint {savepoint}"));
        Ok(())
    }

    fn release(&mut self, table: &mut VirtualTable<Vec<String>>, savepoint: i32) -> Result<()> {
        if savepoint > 8 {
            return Err(Error::with_message(ErrorCode::Busy, format!("savepoint {savepoint} is busy")));
        }
        table.state_mut().push(format!("release {savepoint}"));
        Ok(())
    }

    fn rollback_to(&mut self, table: &mut VirtualTable<Vec<String>>, savepoint: i32) -> Result<()> {
        table.state_mut().push(format!("rollback_to {savepoint}"));
        Ok(())
    }
}

fn keyed_state(engine: &Engine, vtab: *mut sqlite3_vtab) -> Vec<String> {
    engine
        .host::<Keyed>()
        .table(NativeHandle::from_ptr(vtab))
        .expect("registered")
        .state()
        .clone()
}

#[test]
fn planned_constraints_reach_filter() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module("keyed", Keyed).expect("register");
    let engine = Engine::attach(&conn, "keyed");
    let vtab = engine.create(&api, &["keyed", "main", "kv"]).expect("create");

    let caps = IndexCapabilities::from_version(api.api_version());
    let request = IndexNegotiation::new(
        vec![
            IndexConstraint {
                column: 1,
                op: IndexConstraintOp::Gt,
                usable: true,
                term_offset: 0,
            },
            IndexConstraint {
                column: 0,
                op: IndexConstraintOp::Eq,
                usable: true,
                term_offset: 1,
            },
        ],
        vec![IndexOrderBy {
            column: 0,
            desc: false,
        }],
    );
    let info = NativeIndexInfo::new(&api, caps, &request).expect("index info");
    assert_eq!(engine.module.x_best_index.expect("x_best_index")(vtab, info.as_ptr()), 0);

    let layout = IndexInfoLayout::native();
    let plan = unsafe { IndexNegotiation::from_native(caps, info.as_ptr(), true) }.expect("read plan");
    assert_eq!(plan.inputs, request.inputs);
    assert_eq!(plan.outputs.constraint_usages[0].argv_index, 0);
    assert!(!plan.outputs.constraint_usages[0].omit);
    assert_eq!(plan.outputs.constraint_usages[1].argv_index, 1);
    assert!(plan.outputs.constraint_usages[1].omit);
    assert_eq!(plan.outputs.index_number, KEYED_PLAN);
    assert_eq!(plan.outputs.index_string.as_deref(), Some("by-key"));
    assert_eq!(plan.outputs.estimated_cost, Some(1.0));
    assert_eq!(
        unsafe { marshal::read_i32(info.as_ptr(), layout.need_to_free_idx_str) },
        1
    );
    let table = engine
        .host::<Keyed>()
        .table(NativeHandle::from_ptr(vtab))
        .expect("registered");
    assert_eq!(table.index().map(|index| index.inputs.constraints.len()), Some(2));

    let cursor = engine.open(vtab);
    let mut rowid = -1;
    assert_eq!(engine.module.x_rowid.expect("x_rowid")(cursor, &mut rowid), 0);
    assert_eq!(rowid, VirtualTableCursor::<()>::INVALID_ROW_INDEX);

    let idx_str = unsafe { marshal::read_ptr(info.as_ptr(), layout.idx_str) } as *const u8;
    let mut key = MockValue::Integer(42);
    let mut argv = [&mut key as *mut MockValue];
    let rc = engine.module.x_filter.expect("x_filter")(
        cursor,
        plan.outputs.index_number,
        idx_str,
        1,
        argv.as_mut_ptr(),
    );
    assert_eq!(rc, 0);
    let state = engine
        .host::<Keyed>()
        .cursor(NativeHandle::from_ptr(cursor))
        .expect("cursor registered");
    assert_eq!(state.index_number(), KEYED_PLAN);
    assert_eq!(state.index_string(), Some("by-key"));
    assert_eq!(state.values(), &[Value::Integer(42)]);
    assert_eq!(engine.scan(cursor), vec![(1, MockResult::Integer(42))]);

    drop(info);
    assert_eq!(engine.module.x_close.expect("x_close")(cursor), 0);
    assert_eq!(engine.module.x_disconnect.expect("x_disconnect")(vtab), 0);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn connect_registers_reattached_table() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module("keyed", Keyed).expect("register");
    let engine = Engine::attach(&conn, "keyed");
    let vtab = engine.connect(&api, &["keyed", "main", "kv", "extra"]).expect("connect");
    assert_eq!(engine.declared(), vec!["CREATE TABLE x(k, v)".to_owned()]);
    assert_eq!(engine.host::<Keyed>().table_count(), 1);
    assert_eq!(keyed_state(&engine, vtab), vec!["connected".to_owned()]);
    let table = engine
        .host::<Keyed>()
        .table(NativeHandle::from_ptr(vtab))
        .expect("registered");
    assert_eq!(table.table_name(), Some("kv"));
    assert_eq!(table.module_arguments(), &["extra".to_owned()]);

    assert_eq!(engine.module.x_disconnect.expect("x_disconnect")(vtab), 0);
    assert_eq!(engine.host::<Keyed>().table_count(), 0);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}

#[test]
fn transaction_callbacks_pass_through() {
    let api = MockApi::full();
    let conn = open(&api);
    conn.create_module("keyed", Keyed).expect("register");
    let engine = Engine::attach(&conn, "keyed");
    let vtab = engine.create(&api, &["keyed", "main", "kv"]).expect("create");
    let module = engine.module;

    assert_eq!(module.x_begin.expect("x_begin")(vtab), 0);
    assert_eq!(module.x_savepoint.expect("x_savepoint")(vtab, 1), 0);
    assert_eq!(module.x_rollback_to.expect("x_rollback_to")(vtab, 1), 0);
    assert_eq!(module.x_release.expect("x_release")(vtab, 1), 0);
    assert_eq!(module.x_sync.expect("x_sync")(vtab), 0);
    assert_eq!(module.x_commit.expect("x_commit")(vtab), 0);
    assert_eq!(module.x_begin.expect("x_begin")(vtab), 0);
    assert_eq!(module.x_rollback.expect("x_rollback")(vtab), 0);
    assert_eq!(
        keyed_state(&engine, vtab),
        [
            "created",
            "begin",
            "savepoint 1",
            "rollback_to 1",
            "release 1",
            "sync",
            "commit",
            "begin",
            "rollback",
        ]
        .map(String::from)
        .to_vec()
    );

    assert_eq!(module.x_release.expect("x_release")(vtab, 9), 5);
    assert_eq!(table_error(vtab).as_deref(), Some("savepoint 9 is busy"));

    assert_eq!(module.x_disconnect.expect("x_disconnect")(vtab), 0);
    drop(conn);
    assert_eq!(api.outstanding(), 0);
}
