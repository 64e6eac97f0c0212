// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # SOAP 绑定服务器
//!
//! 基于 Tokio 运行时的多线程服务器，托管一个示例计算器服务：
//! - 协议绑定（SOAP 1.1/1.2、HTTP-GET、HTTP-POST）按配置启用
//! - 服务级扩展（压缩、跟踪）由配置文件声明
//! - 每个请求在阻塞线程池中完成解析、扩展链与服务调用
//! - 后台管理控制台（CLI 指令交互）

use soapbind::{
    request::{head_length, request_length},
    Config, Exception, HttpRequest, HttpResponse, MethodBuilder, MethodDescriptor, ParameterInfo,
    Request, ReturnType, ServiceDescriptor, ServiceHost, TypeTag, Value, WebService,
};

use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    runtime::Builder,
};

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Instant,
};

/// 示例服务：整数加法、数组求和、回显与单向 Ping
struct Calculator;

fn int_arg(method: &MethodDescriptor, args: &[Value], index: usize) -> Result<i64, Exception> {
    args.get(index).and_then(Value::as_int).ok_or_else(|| Exception::InvalidValue {
        name: method.parameters[index].name.clone(),
        value: format!("{:?}", args.get(index)),
        type_name: "int",
    })
}

impl WebService for Calculator {
    fn invoke(&self, method: &MethodDescriptor, args: Vec<Value>) -> Result<Option<Value>, Exception> {
        match method.name.as_str() {
            "Add" => {
                let a = int_arg(method, &args, 0)?;
                let b = int_arg(method, &args, 1)?;
                a.checked_add(b)
                    .map(|sum| Some(Value::Int(sum)))
                    .ok_or_else(|| Exception::Application("integer overflow".to_string()))
            }
            "Sum" => {
                let values = args.first().and_then(Value::as_array).unwrap_or(&[]);
                values
                    .iter()
                    .filter_map(Value::as_int)
                    .try_fold(0i64, i64::checked_add)
                    .map(|sum| Some(Value::Int(sum)))
                    .ok_or_else(|| Exception::Application("integer overflow".to_string()))
            }
            "Echo" => Ok(args.into_iter().next()),
            "Ping" => {
                info!("收到 Ping");
                Ok(None)
            }
            other => Err(Exception::UnknownMethod(other.to_string())),
        }
    }
}

fn calculator(namespace: &str) -> ServiceDescriptor {
    ServiceDescriptor::new("Calculator")
        .namespace(namespace)
        .method(
            MethodBuilder::new("Add")
                .param(ParameterInfo::new("a", TypeTag::Int))
                .param(ParameterInfo::new("b", TypeTag::Int))
                .returns(ReturnType::scalar(TypeTag::Int)),
        )
        .method(
            MethodBuilder::new("Sum")
                .param(ParameterInfo::array("values", TypeTag::Int))
                .returns(ReturnType::scalar(TypeTag::Int)),
        )
        .method(
            MethodBuilder::new("Echo")
                .param(ParameterInfo::new("text", TypeTag::String))
                .returns(ReturnType::scalar(TypeTag::String)),
        )
        .method(MethodBuilder::new("Ping").one_way())
}

/// # 程序入口点
///
/// 初始化日志、加载配置、构建服务宿主并启动主事件循环。
fn main() {
    // 1. 日志系统：log4rs，通过外部 YAML 配置级别与输出目的地
    if let Err(e) = log4rs::init_file("config/log4rs.yaml", Default::default()) {
        eprintln!("无法初始化日志系统：{}", e);
    }

    // 2. 运行参数：从 TOML 文件读取
    let config = match Config::from_toml("config/development.toml") {
        Ok(config) => {
            info!("配置文件已载入");
            config
        }
        Err(e) => {
            warn!("{}，使用默认配置", e);
            Config::new()
        }
    };

    // 3. 异步运行时：工作线程数来自配置
    let worker_threads = match config.worker_threads() {
        0 => num_cpus::get(),
        n => n,
    };
    let runtime = match Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("无法创建运行时：{}", e);
            return;
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        error!("服务器异常退出：{}", e);
        std::process::exit(1);
    }
}

async fn serve(config: Config) -> Result<(), Exception> {
    // 4. 服务宿主：元数据（编解码器初始化器、扩展条目）在此一次性构建
    let descriptor = calculator(config.service_namespace());
    let host = Arc::new(ServiceHost::new(descriptor, Arc::new(Calculator), &config)?);
    info!("已启用的协议：{:?}", config.protocols());

    // 5. 网络层：全地址监听 (0.0.0.0) 或本地回环监听 (127.0.0.1)
    let port: u16 = config.port();
    let address = match config.local() {
        true => Ipv4Addr::new(127, 0, 0, 1),
        false => Ipv4Addr::new(0, 0, 0, 0),
    };
    info!("服务端将在{}:{}上监听Socket连接", address, port);
    let listener = TcpListener::bind(SocketAddrV4::new(address, port))
        .await
        .map_err(|e| {
            error!("无法绑定端口：{}，错误：{}", port, e);
            Exception::Io(e)
        })?;
    info!("端口{}绑定完成", port);

    // 6. 生命周期管理：停机标志与活跃连接数
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let active_connection = Arc::new(AtomicU32::new(0));

    // 7. 交互式管理控制台
    tokio::spawn({
        let shutdown_flag = Arc::clone(&shutdown_flag);
        let active_connection = Arc::clone(&active_connection);
        let host = Arc::clone(&host);
        async move {
            let mut reader = BufReader::new(tokio::io::stdin());
            let mut input = String::new();
            loop {
                input.clear();
                match reader.read_line(&mut input).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                match input.trim() {
                    "stop" => {
                        shutdown_flag.store(true, Ordering::SeqCst);
                        println!("停机指令已激活，服务器将在处理完下一个请求后关闭...");
                        break;
                    }
                    "help" => {
                        println!("== soapbind Help ==");
                        println!("stop    - 发出停机信号");
                        println!("status  - 查看当前服务器运行状态");
                        println!("methods - 列出服务方法");
                        println!("help    - 显示此帮助信息");
                        println!("===================");
                    }
                    "status" => {
                        println!("== soapbind 状态 ===");
                        println!("当前活跃连接数: {}", active_connection.load(Ordering::SeqCst));
                        println!("已构建的编解码器初始化器: {}", host.metadata().formatters().len());
                        println!("====================");
                    }
                    "methods" => {
                        for method in host.metadata().descriptor().methods() {
                            println!(
                                "{}({}){}",
                                method.name,
                                method.parameter_names().join(", "),
                                if method.one_way { " [one-way]" } else { "" }
                            );
                        }
                    }
                    cmd => println!("无效的命令：{}", cmd),
                }
            }
        }
    });

    let max_request_size = config.max_request_size();
    let mut id: u128 = 0;

    // 8. 主事件循环
    loop {
        if shutdown_flag.load(Ordering::SeqCst) {
            info!("主循环接收到停机指令，正在退出...");
            break;
        }

        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("接受连接失败：{}", e);
                continue;
            }
        };
        debug!("[ID{}]TCP连接已建立：{}", id, addr);

        let active_connection = Arc::clone(&active_connection);
        let host = Arc::clone(&host);
        let is_local = addr.ip().is_loopback();
        tokio::spawn(async move {
            active_connection.fetch_add(1, Ordering::SeqCst);
            handle_connection(&mut stream, id, is_local, host, max_request_size).await;
            active_connection.fetch_sub(1, Ordering::SeqCst);
        });
        id += 1;
    }
    Ok(())
}

/// 读取一个完整的请求报文：先读到头部结束，再按 Content-Length 读取正文
async fn read_request(stream: &mut TcpStream, max_request_size: usize) -> Result<Vec<u8>, Exception> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = vec![0u8; 4096];
    let mut expected: Option<usize> = None;
    loop {
        if let Some(total) = expected {
            if buffer.len() >= total {
                buffer.truncate(total);
                return Ok(buffer);
            }
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return match expected {
                None if buffer.is_empty() => Err(Exception::Io(std::io::ErrorKind::UnexpectedEof.into())),
                None => Err(Exception::BadRequest("incomplete request head".to_string())),
                Some(_) => Err(Exception::BadRequest("incomplete request body".to_string())),
            };
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > max_request_size {
            return Err(Exception::HttpStatus(413));
        }
        if expected.is_none() {
            if let Some(head) = head_length(&buffer) {
                expected = Some(request_length(&buffer[..head], max_request_size)?);
            }
        }
    }
}

/// # 连接处理器
///
/// 负责单个 TCP 流的生命周期：读取并解析请求、交给服务宿主、发送响应。
async fn handle_connection(
    stream: &mut TcpStream,
    id: u128,
    is_local: bool,
    host: Arc<ServiceHost>,
    max_request_size: usize,
) {
    let buffer = match read_request(stream, max_request_size).await {
        Ok(buffer) => buffer,
        Err(Exception::Io(e)) => {
            debug!("[ID{}]连接在请求完成前关闭：{}", id, e);
            return;
        }
        Err(e) => {
            warn!("[ID{}]读取请求失败：{}", id, e);
            let response = HttpResponse::from_status_code(e.status_code(), None, None);
            let _ = stream.write_all(&response.as_bytes()).await;
            return;
        }
    };
    debug!("[ID{}]HTTP请求接收完毕", id);

    let start_time = Instant::now();

    let mut request = match HttpRequest::try_from(&buffer, id, is_local) {
        Ok(request) => request,
        Err(e) => {
            error!("[ID{}]解析HTTP请求失败: {}", id, e);
            let response = HttpResponse::from_status_code(400, None, None);
            let _ = stream.write_all(&response.as_bytes()).await;
            return;
        }
    };
    let method = request.method();
    let path = request.path().to_string();
    let version = request.version();

    // 扩展链与服务调用都是同步代码，放到阻塞线程池执行
    let response = match tokio::task::spawn_blocking(move || host.handle(&mut request)).await {
        Ok(response) => response,
        Err(e) => {
            error!("[ID{}]处理请求的任务失败：{}", id, e);
            HttpResponse::from_status_code(500, None, None)
        }
    };

    debug!(
        "[ID{}]HTTP响应构建完成，服务端用时{}ms。",
        id,
        start_time.elapsed().as_millis()
    );
    info!(
        "[ID{}] HTTP/{}, {}, {}, {}, {}",
        id,
        version,
        path,
        method,
        response.status_code(),
        response.information(),
    );

    let response_bytes = response.as_bytes();
    debug!("[ID{}]发送全量响应，长度: {}", id, response_bytes.len());
    if let Err(e) = stream.write_all(&response_bytes).await {
        error!("[ID{}]发送响应失败：{}", id, e);
    }
    let _ = stream.flush().await;
}
